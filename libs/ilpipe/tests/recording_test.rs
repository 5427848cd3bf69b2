// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Recording path: pictures from the application through the video encoder
//! into the muxer, with files split by duration.

mod common;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use common::{Recorder, set_state, wait_until};
use ilpipe::{
    AppData, Backends, BufferFlags, BufferHeader, BufferId, BufferPayload, Coding,
    ComponentCallbacks, ComponentHandle, ComponentState, ContainerFormat, Core, Event,
    MemoryMuxerFactory, Muxer, Parameter, PixelFormat, RecorderFileInfo, Result, StreamKind,
    VideoEncoder, VideoFrame, VideoPortFormat, WeakComponentHandle, names,
};

/// Names each new file as the muxer asks for it.
struct FileNamer {
    recorder: Arc<Recorder>,
    muxer: OnceLock<WeakComponentHandle>,
    requested: AtomicUsize,
}

impl ComponentCallbacks for FileNamer {
    fn event_handler(&self, component: &str, event: Event, app_data: Option<&AppData>) {
        if event == Event::MuxerNeedNextFile {
            let n = self.requested.fetch_add(1, Ordering::AcqRel);
            if let Some(muxer) = self.muxer.get().and_then(WeakComponentHandle::upgrade) {
                muxer
                    .set_parameter(&Parameter::ContentUri(format!("mem://clip-{}.mp4", n)))
                    .unwrap();
            }
        }
        self.recorder.event_handler(component, event, app_data);
    }

    fn empty_buffer_done(
        &self,
        component: &str,
        buffer: &BufferHeader,
        app_data: Option<&AppData>,
    ) -> Result<()> {
        self.recorder.empty_buffer_done(component, buffer, app_data)
    }
}

struct Recording {
    core: Core,
    app: Arc<FileNamer>,
    files: MemoryMuxerFactory,
    encoder: ComponentHandle,
    muxer: ComponentHandle,
}

fn build(duration_us: i64) -> Recording {
    let files = MemoryMuxerFactory::new();
    let core = Core::new().with_backends(Backends::default().with_muxers(Arc::new(files.clone())));
    let app = Arc::new(FileNamer {
        recorder: Recorder::new(),
        muxer: OnceLock::new(),
        requested: AtomicUsize::new(0),
    });

    let encoder = core
        .get_handle(names::VIDEO_ENCODER, app.clone(), None)
        .unwrap();
    let muxer = core.get_handle(names::MUXER, app.clone(), None).unwrap();
    let _ = app.muxer.set(muxer.downgrade());

    encoder
        .set_parameter(&Parameter::VideoPortFormat(VideoPortFormat {
            port: VideoEncoder::IN_PORT,
            width: 16,
            height: 16,
            ..Default::default()
        }))
        .unwrap();
    encoder.set_parameter(&Parameter::QFactor(90)).unwrap();
    muxer
        .set_parameter(&Parameter::ContentUri("mem://unnamed.mp4".into()))
        .unwrap();
    muxer
        .set_parameter(&Parameter::RecorderFileInfo(RecorderFileInfo {
            duration_us,
            file_count: 4,
            container: ContainerFormat::Mp4,
        }))
        .unwrap();
    muxer
        .set_parameter(&Parameter::VideoPortFormat(VideoPortFormat {
            port: Muxer::VIDEO_PORT,
            coding: Coding::Mjpeg,
            width: 16,
            height: 16,
            ..Default::default()
        }))
        .unwrap();

    core.setup_tunnel(
        Some(&encoder),
        VideoEncoder::OUT_PORT,
        Some(&muxer),
        Muxer::VIDEO_PORT,
    )
    .unwrap();

    Recording {
        core,
        app,
        files,
        encoder,
        muxer,
    }
}

impl Recording {
    fn recorder(&self) -> &Recorder {
        &self.app.recorder
    }

    fn go(&self, state: ComponentState) {
        for handle in [&self.muxer, &self.encoder] {
            set_state(self.recorder(), handle, state);
        }
    }

    fn send(&self, pts: i64, flags: BufferFlags) {
        let frame = VideoFrame {
            id: pts as u64,
            pts,
            flags,
            width: 16,
            height: 16,
            format: PixelFormat::Nv12,
            data: Bytes::from(vec![0x20u8; 64]),
            ..Default::default()
        };
        let mut header = BufferHeader::new(BufferId::next(), BufferPayload::Video(frame));
        header.timestamp = pts;
        header.flags = flags;
        self.encoder.empty_this_buffer(&header).unwrap();
    }

    fn counters(handle: &ComponentHandle) -> HashMap<&'static str, u64> {
        handle.counters().into_iter().collect()
    }

    /// Free both components. They must already be Loaded.
    fn free(self) {
        for handle in [&self.encoder, &self.muxer] {
            self.core.free_handle(handle).unwrap();
        }
    }
}

#[test]
fn test_recording_splits_files_by_duration() {
    let rec = build(80_000);
    rec.go(ComponentState::Idle);
    rec.go(ComponentState::Executing);

    for i in 0..6 {
        let flags = if i == 5 {
            BufferFlags::EOS
        } else {
            BufferFlags::empty()
        };
        rec.send(i * 40_000, flags);
    }

    assert!(rec.recorder().wait_for(names::MUXER, |e| {
        *e == Event::BufferFlag {
            port: Muxer::VIDEO_PORT,
        }
    }));
    assert!(rec.recorder().wait_for_emptied(names::VIDEO_ENCODER, 6));
    assert!(wait_until(|| {
        Recording::counters(&rec.encoder)["packets_returned"] == 6
    }));

    rec.go(ComponentState::Idle);
    let files = rec.files.files();
    assert_eq!(files.len(), 2);
    assert_eq!(files[0].uri, "mem://clip-0.mp4");
    assert_eq!(files[1].uri, "mem://clip-1.mp4");
    let pts: Vec<Vec<i64>> = files
        .iter()
        .map(|f| f.packets.iter().map(|p| p.pts).collect())
        .collect();
    assert_eq!(pts, vec![vec![0, 40_000, 80_000, 120_000], vec![160_000, 200_000]]);
    assert!(files.iter().all(|f| f.header_written && f.finished));
    assert!(
        files
            .iter()
            .flat_map(|f| &f.packets)
            .all(|p| p.kind == StreamKind::Video && p.len == 64)
    );

    assert_eq!(Recording::counters(&rec.muxer)["written"], 6);
    assert_eq!(
        rec.recorder()
            .count(names::VIDEO_ENCODER, |e| matches!(e, Event::BufferFlag { .. })),
        1
    );
    for (handle, port) in [
        (&rec.encoder, VideoEncoder::IN_PORT),
        (&rec.encoder, VideoEncoder::OUT_PORT),
        (&rec.muxer, Muxer::VIDEO_PORT),
    ] {
        let counts = handle.buffer_counts(port).unwrap();
        assert!(counts.is_settled(), "{}:{} holds {:?}", handle.name(), port, counts);
    }

    rec.go(ComponentState::Loaded);
    rec.free();
}

#[test]
fn test_restart_opens_a_fresh_file() {
    let rec = build(0);
    rec.go(ComponentState::Idle);
    rec.go(ComponentState::Executing);
    rec.send(0, BufferFlags::EOS);
    assert!(
        rec.recorder()
            .wait_for(names::MUXER, |e| matches!(e, Event::BufferFlag { .. }))
    );

    rec.go(ComponentState::Idle);
    rec.go(ComponentState::Executing);
    rec.send(40_000, BufferFlags::EOS);
    assert!(wait_until(|| {
        rec.recorder()
            .count(names::MUXER, |e| matches!(e, Event::BufferFlag { .. }))
            == 2
    }));

    rec.go(ComponentState::Idle);
    let files = rec.files.files();
    let uris: Vec<_> = files.iter().map(|f| f.uri.as_str()).collect();
    assert_eq!(uris, vec!["mem://clip-0.mp4", "mem://clip-1.mp4"]);
    assert!(files.iter().all(|f| f.finished && f.packets.len() == 1));
    assert_eq!(Recording::counters(&rec.muxer)["files"], 2);

    rec.go(ComponentState::Loaded);
    rec.free();
}

#[test]
fn test_pictures_are_refused_until_executing() {
    let rec = build(0);
    let frame = BufferHeader::new(BufferId::next(), BufferPayload::Video(VideoFrame::default()));
    assert!(rec.encoder.empty_this_buffer(&frame).is_err());

    rec.go(ComponentState::Idle);
    assert!(rec.encoder.empty_this_buffer(&frame).is_err());
    assert!(rec.files.files().is_empty(), "no file is opened while Idle");
    rec.go(ComponentState::Loaded);
    rec.free();
}
