// Copyright 2026 The Toolshim Project
// SPDX-License-Identifier: Apache-2.0

// SSE transcoding for tool-call text
//
// Responsibilities:
// - Reassemble event-stream frames from arbitrarily split network chunks
// - Forward ordinary text as it arrives
// - Hold back any tail that could be the start of a call marker
// - Buffer the tool-call region and emit it as a `delta.tool_calls` event
// - Forward unparsable frames unchanged

mod frame;
mod transcoder;

pub use frame::{Frame, FrameKind, FrameSplitter, DONE_SENTINEL, MAX_FRAME_BYTES};
pub use transcoder::{holdback_len, transcode, Phase, StreamTranscoder};
