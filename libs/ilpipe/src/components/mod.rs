// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Player and recorder components. Each one registers itself under a name
//! from [`names`] and is created through [`Core::get_handle`](crate::core::registry::Core::get_handle).

mod audio_render;
mod clock;
mod decoder;
mod demuxer;
mod encoder;
mod frame_queue;
mod muxer;
mod video_render;

pub use audio_render::AudioRender;
pub use clock::Clock;
pub use decoder::{AudioDecoder, VideoDecoder};
pub use demuxer::Demuxer;
pub use encoder::VideoEncoder;
pub use muxer::Muxer;
pub use video_render::VideoRender;

/// Registered component names.
pub mod names {
    pub const DEMUXER: &str = "ilpipe.demuxer";
    pub const VIDEO_DECODER: &str = "ilpipe.video_decoder";
    pub const AUDIO_DECODER: &str = "ilpipe.audio_decoder";
    pub const AUDIO_RENDER: &str = "ilpipe.audio_render";
    pub const VIDEO_RENDER: &str = "ilpipe.video_render";
    pub const CLOCK: &str = "ilpipe.clock";
    pub const VIDEO_ENCODER: &str = "ilpipe.video_encoder";
    pub const MUXER: &str = "ilpipe.muxer";

    pub const ALL: [&str; 8] = [
        DEMUXER,
        VIDEO_DECODER,
        AUDIO_DECODER,
        AUDIO_RENDER,
        VIDEO_RENDER,
        CLOCK,
        VIDEO_ENCODER,
        MUXER,
    ];
}

#[cfg(test)]
mod tests {
    use super::names;
    use crate::core::Core;

    #[test]
    fn test_every_component_is_registered() {
        let mut registered = Core::component_names();
        registered.sort_unstable();
        let mut expected = names::ALL.to_vec();
        expected.sort_unstable();
        assert_eq!(registered, expected);
    }
}
