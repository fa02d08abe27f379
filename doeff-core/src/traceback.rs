//! Cross-segment traceback assembly for `GetTraceback`.

use crate::continuation::Continuation;
use crate::segment::{Frame, FrameMetadata};

/// One `Delegate` hop's worth of frames.
#[derive(Debug, Clone)]
pub struct TracebackHop {
    pub frames: Vec<FrameMetadata>,
}

/// The assembled traceback for a continuation: one hop per `Delegate` taken
/// on its dispatch path, innermost first.
#[derive(Debug, Clone, Default)]
pub struct Traceback {
    pub hops: Vec<TracebackHop>,
}

/// The innermost `Program`/`HostStream` frame captured in `k.frames` names
/// the call site that was executing at capture time, so it takes priority
/// over the coarser `CallMetadata` stamped on the continuation itself.
fn hop_metadata(k: &Continuation) -> FrameMetadata {
    for frame in k.frames.iter().rev() {
        match frame {
            Frame::Program { metadata } | Frame::HostStream { metadata, .. } => return metadata.clone(),
            _ => {}
        }
    }
    if k.metadata.function_name.is_empty() {
        FrameMetadata::unknown()
    } else {
        FrameMetadata::new(k.metadata.function_name.clone(), k.metadata.source_file.clone(), k.metadata.source_line)
    }
}

impl Traceback {
    /// Walk `k`'s parent chain, emitting one hop per link. Frame metadata
    /// prefers the live call-site location baked into each `Continuation`'s
    /// captured frames at capture time, falling back to `FrameMetadata::unknown()`.
    pub fn capture(k: &Continuation) -> Self {
        let mut hops = Vec::new();
        hops.push(TracebackHop {
            frames: vec![hop_metadata(k)],
        });
        for parent in k.parent_chain() {
            hops.push(TracebackHop {
                frames: vec![hop_metadata(&parent)],
            });
        }
        Self { hops }
    }
}
