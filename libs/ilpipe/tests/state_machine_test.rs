// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Component state machine and end-of-stream reporting, observed from the
//! application side.

mod common;

use bytes::Bytes;
use common::{Recorder, set_state, settle};
use ilpipe::{
    AudioDecoder, AudioFrame, AudioPortFormat, AudioRender, BufferFlags, BufferHeader, BufferId,
    BufferPayload, Coding, Command, ComponentHandle, ComponentState, Config, Core, ErrorCode,
    Event, Parameter, PipelineError, names,
};

fn error(code: ErrorCode, data: u32) -> impl Fn(&Event) -> bool {
    move |e| *e == Event::Error { code, data }
}

fn audio_frame(pts: i64, flags: BufferFlags) -> BufferHeader {
    let frame = AudioFrame {
        id: pts as u64,
        pts,
        flags,
        channels: 2,
        sample_rate: 44_100,
        bits_per_sample: 16,
        data: Bytes::from(vec![0u8; 32]),
    };
    let mut header = BufferHeader::new(BufferId::next(), BufferPayload::Audio(frame));
    header.timestamp = pts;
    header.flags = flags;
    header
}

fn free(core: &Core, recorder: &Recorder, handle: &ComponentHandle) {
    if handle.get_state() == ComponentState::Executing {
        set_state(recorder, handle, ComponentState::Idle);
    }
    if handle.get_state() == ComponentState::Idle {
        set_state(recorder, handle, ComponentState::Loaded);
    }
    core.free_handle(handle).unwrap();
}

// ============================================================================
// Transitions
// ============================================================================

#[test]
fn test_same_state_is_reported_and_ignored() {
    let core = Core::new();
    let recorder = Recorder::new();
    let clock = core.get_handle(names::CLOCK, recorder.clone(), None).unwrap();

    clock
        .send_command(Command::StateSet(ComponentState::Loaded), None)
        .unwrap();
    assert!(recorder.wait_for(names::CLOCK, error(ErrorCode::SameState, 0)));
    assert_eq!(clock.get_state(), ComponentState::Loaded);

    free(&core, &recorder, &clock);
}

#[test]
fn test_illegal_transitions_keep_state() {
    let core = Core::new();
    let recorder = Recorder::new();
    let clock = core.get_handle(names::CLOCK, recorder.clone(), None).unwrap();
    let loaded = ComponentState::Loaded.as_raw();

    for target in [ComponentState::Executing, ComponentState::Pause] {
        clock
            .send_command(Command::StateSet(target), None)
            .unwrap();
    }
    // Commands are handled in order, so one more round trip flushes both.
    set_state(&recorder, &clock, ComponentState::Idle);

    assert_eq!(
        recorder.count(
            names::CLOCK,
            error(ErrorCode::IncorrectStateTransition, loaded)
        ),
        2
    );

    free(&core, &recorder, &clock);
}

#[test]
fn test_full_cycle_through_pause() {
    let core = Core::new();
    let recorder = Recorder::new();
    let render = core
        .get_handle(names::VIDEO_RENDER, recorder.clone(), None)
        .unwrap();

    for state in [
        ComponentState::Idle,
        ComponentState::Pause,
        ComponentState::Executing,
        ComponentState::Pause,
        ComponentState::Idle,
        ComponentState::Loaded,
    ] {
        set_state(&recorder, &render, state);
    }
    assert!(
        recorder
            .events_for(names::VIDEO_RENDER)
            .iter()
            .all(|e| !e.is_error())
    );

    core.free_handle(&render).unwrap();
}

#[test]
fn test_invalid_is_terminal() {
    let core = Core::new();
    let recorder = Recorder::new();
    let clock = core.get_handle(names::CLOCK, recorder.clone(), None).unwrap();

    clock
        .send_command(Command::StateSet(ComponentState::Invalid), None)
        .unwrap();
    assert!(recorder.wait_for(names::CLOCK, common::is_state_complete(ComponentState::Invalid)));
    assert!(recorder.count(names::CLOCK, error(ErrorCode::InvalidState, 0)) == 1);
    assert_eq!(clock.get_state(), ComponentState::Invalid);

    clock
        .send_command(Command::StateSet(ComponentState::Idle), None)
        .unwrap();
    assert!(recorder.wait_for(
        names::CLOCK,
        error(
            ErrorCode::IncorrectStateTransition,
            ComponentState::Invalid.as_raw()
        )
    ));
    assert_eq!(clock.get_state(), ComponentState::Invalid);

    // Only Loaded components may be freed.
    assert!(matches!(
        core.free_handle(&clock),
        Err(PipelineError::IncorrectStateOperation(ComponentState::Invalid))
    ));
}

#[test]
fn test_decoder_without_format_refuses_idle() {
    let core = Core::new();
    let recorder = Recorder::new();
    let decoder = core
        .get_handle(names::VIDEO_DECODER, recorder.clone(), None)
        .unwrap();

    decoder
        .send_command(Command::StateSet(ComponentState::Idle), None)
        .unwrap();
    assert!(recorder.wait_for(
        names::VIDEO_DECODER,
        error(
            ErrorCode::IncorrectStateTransition,
            ComponentState::Loaded.as_raw()
        )
    ));
    assert_eq!(decoder.get_state(), ComponentState::Loaded);

    core.free_handle(&decoder).unwrap();
}

#[test]
fn test_demuxer_without_content_refuses_executing() {
    let core = Core::new();
    let recorder = Recorder::new();
    let demuxer = core
        .get_handle(names::DEMUXER, recorder.clone(), None)
        .unwrap();

    set_state(&recorder, &demuxer, ComponentState::Idle);
    demuxer
        .send_command(Command::StateSet(ComponentState::Executing), None)
        .unwrap();
    assert!(recorder.wait_for(
        names::DEMUXER,
        error(
            ErrorCode::IncorrectStateTransition,
            ComponentState::Idle.as_raw()
        )
    ));
    assert_eq!(demuxer.get_state(), ComponentState::Idle);

    free(&core, &recorder, &demuxer);
}

// ============================================================================
// Data plane gated by state
// ============================================================================

#[test]
fn test_buffers_refused_outside_executing() {
    let core = Core::new();
    let recorder = Recorder::new();
    let render = core
        .get_handle(names::AUDIO_RENDER, recorder.clone(), None)
        .unwrap();

    let result = render.empty_this_buffer(&audio_frame(0, BufferFlags::empty()));
    assert!(matches!(
        result,
        Err(PipelineError::IncorrectStateOperation(ComponentState::Loaded))
    ));

    core.free_handle(&render).unwrap();
}

#[test]
fn test_untunneled_decoder_round_trip() {
    let core = Core::new();
    let recorder = Recorder::new();
    let decoder = core
        .get_handle(names::AUDIO_DECODER, recorder.clone(), None)
        .unwrap();

    decoder
        .set_parameter(&Parameter::AudioPortFormat(AudioPortFormat {
            port: AudioDecoder::IN_PORT,
            coding: Coding::Pcm,
            channels: 2,
            sample_rate: 48_000,
            bits_per_sample: 16,
        }))
        .unwrap();
    set_state(&recorder, &decoder, ComponentState::Idle);
    set_state(&recorder, &decoder, ComponentState::Executing);

    let packet = BufferHeader::packet(
        BufferId::next(),
        Bytes::from_static(&[1, 2, 3, 4]),
        2_000,
        BufferFlags::EOS,
    );
    decoder.empty_this_buffer(&packet).unwrap();

    assert!(recorder.wait_for(names::AUDIO_DECODER, |e| {
        *e == Event::BufferFlag {
            port: AudioDecoder::OUT_PORT,
        }
    }));
    assert_eq!(recorder.emptied(names::AUDIO_DECODER)[0].id, packet.id);

    let filled = recorder.filled(names::AUDIO_DECODER);
    assert_eq!(filled.len(), 1);
    assert_eq!(filled[0].timestamp, 2_000);
    assert!(filled[0].is_eos());
    assert_eq!(
        decoder
            .buffer_counts(AudioDecoder::OUT_PORT)
            .unwrap()
            .processing,
        1
    );

    // Returning the lent frame settles the output list.
    decoder.fill_this_buffer(&filled[0]).unwrap();
    assert_eq!(
        decoder
            .buffer_counts(AudioDecoder::OUT_PORT)
            .unwrap()
            .processing,
        0
    );
    // A frame that is not lent out is refused.
    assert!(matches!(
        decoder.fill_this_buffer(&filled[0]),
        Err(PipelineError::BadParameter(_))
    ));

    free(&core, &recorder, &decoder);
}

// ============================================================================
// End of stream
// ============================================================================

#[test]
fn test_end_of_stream_reported_once_per_session() {
    let core = Core::new();
    let recorder = Recorder::new();
    let render = core
        .get_handle(names::AUDIO_RENDER, recorder.clone(), None)
        .unwrap();
    set_state(&recorder, &render, ComponentState::Idle);
    set_state(&recorder, &render, ComponentState::Executing);

    let is_flag = |e: &Event| {
        *e == Event::BufferFlag {
            port: AudioRender::IN_PORT,
        }
    };

    render
        .empty_this_buffer(&audio_frame(0, BufferFlags::empty()))
        .unwrap();
    render
        .empty_this_buffer(&audio_frame(1_000, BufferFlags::EOS))
        .unwrap();
    assert!(recorder.wait_for(names::AUDIO_RENDER, is_flag));

    // Anything after the end is parked, and no second report goes out.
    for pts in [2_000, 3_000] {
        render
            .empty_this_buffer(&audio_frame(pts, BufferFlags::EOS))
            .unwrap();
    }
    render.set_parameter(&Parameter::FrameEnd(true)).unwrap();
    settle();
    assert_eq!(recorder.count(names::AUDIO_RENDER, is_flag), 1);
    assert!(recorder.wait_for_emptied(names::AUDIO_RENDER, 2));

    // Repositioning starts a new session: parked frames go back and the next
    // end of stream is reported again.
    render.set_config(&Config::TimePosition(0)).unwrap();
    assert!(recorder.wait_for_emptied(names::AUDIO_RENDER, 4));
    render
        .empty_this_buffer(&audio_frame(0, BufferFlags::EOS))
        .unwrap();
    assert!(common::wait_until(|| {
        recorder.count(names::AUDIO_RENDER, is_flag) == 2
    }));

    free(&core, &recorder, &render);
    assert_eq!(recorder.emptied(names::AUDIO_RENDER).len(), 5);
}
