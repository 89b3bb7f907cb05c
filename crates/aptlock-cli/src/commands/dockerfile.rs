use super::{json_pretty, Context, Failure, EXIT_SUCCESS};
use aptlock_core::{generate, CoreError};

/// Print the generated build specification. Needs no build engine.
pub fn run(ctx: &Context) -> Result<u8, Failure> {
    let project = ctx.load_project()?;
    let options = ctx.config.generate_options();
    let dockerfile = generate(&project.manifest, project.lock.as_ref(), &options)
        .map_err(CoreError::from)?;

    if ctx.json {
        let payload = serde_json::json!({
            "image": project.manifest.image,
            "dockerfile": dockerfile,
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        print!("{dockerfile}");
    }
    Ok(EXIT_SUCCESS)
}
