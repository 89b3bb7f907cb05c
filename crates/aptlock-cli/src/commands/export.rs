use super::{json_pretty, spin_fail, spin_ok, Context, Failure, EXIT_SUCCESS};
use aptlock_core::Builder;
use std::path::Path;

pub async fn run(ctx: &Context, builder: &Builder, output: Option<&Path>) -> Result<u8, Failure> {
    let project = ctx.load_project()?;
    let pb = ctx.spinner(&format!("exporting {}...", project.manifest.image));

    let outcome = match builder
        .export(&project.manifest, project.lock.as_ref(), output)
        .await
    {
        Ok(outcome) => {
            spin_ok(pb.as_ref(), &format!("exported {}", outcome.image));
            outcome
        }
        Err(e) => {
            spin_fail(pb.as_ref(), "export failed");
            return Err(e.into());
        }
    };

    if ctx.json {
        println!("{}", json_pretty(&outcome)?);
    } else {
        println!(
            "imported {} ({} bytes) from {}",
            outcome.image, outcome.bytes, outcome.tag
        );
        if let Some(path) = &outcome.path {
            println!("wrote {}", path.display());
        }
    }
    Ok(EXIT_SUCCESS)
}
