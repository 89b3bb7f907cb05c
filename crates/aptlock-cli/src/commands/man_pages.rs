use super::{Failure, EXIT_FAILURE, EXIT_SUCCESS};
use clap::CommandFactory;
use std::path::Path;

fn write_page(cmd: clap::Command, path: &Path) -> Result<(), Failure> {
    let mut buf = Vec::new();
    clap_mangen::Man::new(cmd)
        .render(&mut buf)
        .map_err(|e| Failure::new(EXIT_FAILURE, format!("man page render failed: {e}")))?;
    std::fs::write(path, &buf).map_err(|e| {
        Failure::new(
            EXIT_FAILURE,
            format!("failed to write {}: {e}", path.display()),
        )
    })
}

pub fn run<C: CommandFactory>(dir: &Path) -> Result<u8, Failure> {
    std::fs::create_dir_all(dir)
        .map_err(|e| Failure::new(EXIT_FAILURE, format!("failed to create dir: {e}")))?;
    let cmd = C::command();
    write_page(cmd.clone(), &dir.join("aptlock.1"))?;
    for sub in cmd.get_subcommands() {
        let path = dir.join(format!("aptlock-{}.1", sub.get_name()));
        write_page(sub.clone(), &path)?;
    }
    println!("man pages written to {}", dir.display());
    Ok(EXIT_SUCCESS)
}
