//! Call-chain compression.
//!
//! Full traces of loops are long and repetitive. The oracle only needs the
//! sequence of functions visited and which blocks were entered in each
//! visit, so consecutive markers sharing `(context, label)` collapse into one
//! frame, and identical consecutive frames collapse into a repeat count.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::marker::MarkerId;

/// One visit to a function (or any labelled region) in trace order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub context: Option<String>,
    pub label: String,
    /// Ordinals of `enter` markers hit during this visit.
    pub entered: BTreeSet<u32>,
    /// How many identical consecutive visits this frame stands for.
    pub repeat: u32,
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let context = self.context.as_deref().unwrap_or("?");
        let entered: Vec<String> = self.entered.iter().map(u32::to_string).collect();
        write!(f, "{{{context}}}[{}][{}]", self.label, entered.join(","))?;
        if self.repeat > 1 {
            write!(f, " x{}", self.repeat)?;
        }
        Ok(())
    }
}

/// Compressed call chain of one execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallChain {
    pub frames: Vec<Frame>,
}

impl CallChain {
    pub fn compress(markers: &[MarkerId]) -> Self {
        let mut frames: Vec<Frame> = Vec::new();
        let mut current: Option<Frame> = None;

        for marker in markers {
            let same_region = current.as_ref().is_some_and(|frame| {
                frame.context == marker.context && frame.label == marker.label
            });
            if !same_region {
                if let Some(done) = current.take() {
                    push_frame(&mut frames, done);
                }
                current = Some(Frame {
                    context: marker.context.clone(),
                    label: marker.label.clone(),
                    entered: BTreeSet::new(),
                    repeat: 1,
                });
            }
            if marker.is_enter() {
                if let Some(frame) = current.as_mut() {
                    frame.entered.insert(marker.ordinal);
                }
            }
        }

        if let Some(done) = current {
            push_frame(&mut frames, done);
        }

        Self { frames }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

impl fmt::Display for CallChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.frames.iter().map(Frame::to_string).collect();
        write!(f, "{}", parts.join(" -> "))
    }
}

fn push_frame(frames: &mut Vec<Frame>, frame: Frame) {
    // A visit that only emitted exit markers carries no block information.
    if frame.entered.is_empty() {
        return;
    }
    if let Some(last) = frames.last_mut() {
        if last.context == frame.context && last.label == frame.label && last.entered == frame.entered {
            last.repeat += frame.repeat;
            return;
        }
    }
    frames.push(frame);
}
