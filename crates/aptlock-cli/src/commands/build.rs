use super::{json_pretty, spin_fail, spin_ok, Context, Failure, EXIT_SUCCESS};
use aptlock_core::Builder;

pub async fn run(ctx: &Context, builder: &Builder) -> Result<u8, Failure> {
    let project = ctx.load_project()?;
    let pb = ctx.spinner(&format!("building {}...", project.manifest.image));

    let outcome = match builder.build(&project.manifest, project.lock.as_ref()).await {
        Ok(outcome) => {
            spin_ok(pb.as_ref(), &format!("built {}", outcome.tag));
            outcome
        }
        Err(e) => {
            spin_fail(pb.as_ref(), "build failed");
            return Err(e.into());
        }
    };

    if ctx.json {
        let payload = serde_json::json!({
            "image": project.manifest.image,
            "tag": outcome.tag,
            "image_id": outcome.image_id,
            "locked": project.lock.is_some(),
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        println!("built image {}", outcome.tag);
        if let Some(id) = &outcome.image_id {
            println!("image_id: {id}");
        }
        if project.lock.is_none() {
            println!("note: no lock file; run `aptlock update` to pin packages");
        }
    }
    Ok(EXIT_SUCCESS)
}
