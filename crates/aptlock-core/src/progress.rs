use crate::CoreError;
use aptlock_engine::{EngineError, ProgressStream};
use futures_util::StreamExt;
use std::io::Write;
use tracing::{debug, warn};

/// What a fully drained build reported.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildSummary {
    /// Image id announced by the engine, if any.
    pub image_id: Option<String>,
    pub lines: usize,
}

/// Consume a build progress stream to the end.
///
/// Every event is logged at debug and, when `echo` is given, written to it.
/// The stream is read to completion even when nothing is echoed. A step
/// failure ends the build with [`CoreError::BuildStep`]; an undecodable event
/// with [`CoreError::ProgressDecode`]; anything else from the engine with
/// [`CoreError::Build`].
pub async fn drain(
    mut stream: ProgressStream<'_>,
    tag: &str,
    mut echo: Option<&mut (dyn Write + Send)>,
) -> Result<BuildSummary, CoreError> {
    let mut summary = BuildSummary::default();
    while let Some(item) = stream.next().await {
        let event = match item {
            Ok(event) => event,
            Err(EngineError::Decode(message)) => {
                return Err(CoreError::ProgressDecode {
                    tag: tag.to_owned(),
                    message,
                })
            }
            Err(source) => {
                return Err(CoreError::Build {
                    tag: tag.to_owned(),
                    source,
                })
            }
        };

        if let Some(message) = event.error {
            return Err(CoreError::BuildStep {
                tag: tag.to_owned(),
                message: message.trim_end().to_owned(),
            });
        }
        for text in [event.stream.as_deref(), event.status.as_deref()]
            .into_iter()
            .flatten()
        {
            for line in text.lines().filter(|l| !l.trim().is_empty()) {
                summary.lines += 1;
                debug!(tag, line = line.trim_end(), "build output");
                let echoed = match echo.as_mut() {
                    Some(out) => writeln!(out, "{line}"),
                    None => Ok(()),
                };
                if let Err(e) = echoed {
                    warn!("failed to echo build output: {e}");
                    echo = None;
                }
            }
        }
        if let Some(id) = event.image_id {
            summary.image_id = Some(id);
        }
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use aptlock_engine::ProgressEvent;
    use futures_util::stream;

    fn events(items: Vec<Result<ProgressEvent, EngineError>>) -> ProgressStream<'static> {
        stream::iter(items).boxed()
    }

    #[tokio::test]
    async fn drains_and_echoes() {
        let mut out: Vec<u8> = Vec::new();
        let summary = drain(
            events(vec![
                Ok(ProgressEvent::output("Step 1/2 : FROM debian:bookworm-slim\n")),
                Ok(ProgressEvent::output("\n")),
                Ok(ProgressEvent::output("Step 2/2 : RUN apt-get update\n")),
                Ok(ProgressEvent {
                    image_id: Some("sha256:abc".to_owned()),
                    ..ProgressEvent::default()
                }),
            ]),
            "t",
            Some(&mut out),
        )
        .await
        .unwrap();
        assert_eq!(summary.lines, 2);
        assert_eq!(summary.image_id.as_deref(), Some("sha256:abc"));
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "Step 1/2 : FROM debian:bookworm-slim\nStep 2/2 : RUN apt-get update\n"
        );
    }

    #[tokio::test]
    async fn step_failure_is_distinct_from_decode_failure() {
        let step = drain(
            events(vec![Ok(ProgressEvent::failure("returned a non-zero code: 100\n"))]),
            "t",
            None,
        )
        .await
        .unwrap_err();
        assert!(matches!(step, CoreError::BuildStep { ref message, .. } if message == "returned a non-zero code: 100"));

        let decode = drain(
            events(vec![Err(EngineError::Decode("bad json".to_owned()))]),
            "t",
            None,
        )
        .await
        .unwrap_err();
        assert!(matches!(decode, CoreError::ProgressDecode { .. }));

        let transport = drain(
            events(vec![Err(EngineError::Transport("reset".to_owned()))]),
            "t",
            None,
        )
        .await
        .unwrap_err();
        assert!(matches!(transport, CoreError::Build { .. }));
    }
}
