// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Container writer boundary.

use std::sync::Arc;

use parking_lot::Mutex;

use super::parser::StreamKind;
use crate::core::buffer::BufferFlags;
use crate::core::error::{PipelineError, Result};
use crate::core::params::{AudioPortFormat, ContainerFormat, VideoPortFormat};

/// Streams a new file will carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MuxerStreams {
    pub video: Option<VideoPortFormat>,
    pub audio: Option<AudioPortFormat>,
}

#[derive(Debug, Clone, Copy)]
pub struct MuxerPacket<'a> {
    pub kind: StreamKind,
    pub data: &'a [u8],
    pub pts: i64,
    pub flags: BufferFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    Written,
    /// Storage is full. The packet was not written and may be retried.
    NoSpace,
}

pub trait MuxerWriter: Send {
    fn write_header(&mut self) -> Result<()>;

    fn write_packet(&mut self, packet: MuxerPacket<'_>) -> Result<WriteStatus>;

    /// Finish the file. No packet may follow.
    fn write_trailer(&mut self) -> Result<()>;
}

pub trait MuxerFactory: Send + Sync {
    fn create(
        &self,
        uri: &str,
        container: ContainerFormat,
        streams: &MuxerStreams,
    ) -> Result<Box<dyn MuxerWriter>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordedPacket {
    pub kind: StreamKind,
    pub pts: i64,
    pub len: usize,
}

/// What a [`MemoryMuxer`] wrote into one file.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedFile {
    pub uri: String,
    pub container: ContainerFormat,
    pub streams: MuxerStreams,
    pub header_written: bool,
    pub packets: Vec<RecordedPacket>,
    pub finished: bool,
}

#[derive(Default)]
struct Recording {
    files: Vec<RecordedFile>,
    /// Packets that still fit. `None` is unlimited.
    space: Option<usize>,
}

/// Writer that records file structure in memory instead of producing bytes.
pub struct MemoryMuxer {
    recording: Arc<Mutex<Recording>>,
    file: usize,
}

impl MemoryMuxer {
    fn with_file<R>(&self, f: impl FnOnce(&mut RecordedFile) -> Result<R>) -> Result<R> {
        let mut recording = self.recording.lock();
        let file = recording
            .files
            .get_mut(self.file)
            .ok_or_else(|| PipelineError::Undefined("recorded file vanished".into()))?;
        f(file)
    }
}

impl MuxerWriter for MemoryMuxer {
    fn write_header(&mut self) -> Result<()> {
        self.with_file(|file| {
            if file.header_written {
                return Err(PipelineError::Undefined(format!(
                    "{} already has a header",
                    file.uri
                )));
            }
            file.header_written = true;
            Ok(())
        })
    }

    fn write_packet(&mut self, packet: MuxerPacket<'_>) -> Result<WriteStatus> {
        let mut recording = self.recording.lock();
        if recording.space == Some(0) {
            return Ok(WriteStatus::NoSpace);
        }
        let file = recording
            .files
            .get_mut(self.file)
            .ok_or_else(|| PipelineError::Undefined("recorded file vanished".into()))?;
        if !file.header_written || file.finished {
            return Err(PipelineError::Undefined(format!(
                "{} is not open for packets",
                file.uri
            )));
        }
        file.packets.push(RecordedPacket {
            kind: packet.kind,
            pts: packet.pts,
            len: packet.data.len(),
        });
        if let Some(space) = recording.space.as_mut() {
            *space -= 1;
        }
        Ok(WriteStatus::Written)
    }

    fn write_trailer(&mut self) -> Result<()> {
        self.with_file(|file| {
            file.finished = true;
            Ok(())
        })
    }
}

/// Hands out [`MemoryMuxer`]s and keeps every file they wrote.
#[derive(Clone, Default)]
pub struct MemoryMuxerFactory {
    recording: Arc<Mutex<Recording>>,
}

impl MemoryMuxerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn files(&self) -> Vec<RecordedFile> {
        self.recording.lock().files.clone()
    }

    /// Allow only `packets` more writes across all files, or lift the limit.
    pub fn limit_space(&self, packets: Option<usize>) {
        self.recording.lock().space = packets;
    }
}

impl MuxerFactory for MemoryMuxerFactory {
    fn create(
        &self,
        uri: &str,
        container: ContainerFormat,
        streams: &MuxerStreams,
    ) -> Result<Box<dyn MuxerWriter>> {
        if uri.is_empty() {
            return Err(PipelineError::BadParameter("no output uri".into()));
        }
        if streams.video.is_none() && streams.audio.is_none() {
            return Err(PipelineError::BadParameter(format!(
                "{} would carry no stream",
                uri
            )));
        }
        let mut recording = self.recording.lock();
        recording.files.push(RecordedFile {
            uri: uri.to_string(),
            container,
            streams: *streams,
            header_written: false,
            packets: Vec::new(),
            finished: false,
        });
        Ok(Box::new(MemoryMuxer {
            recording: Arc::clone(&self.recording),
            file: recording.files.len() - 1,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::params::Coding;

    fn video_only() -> MuxerStreams {
        MuxerStreams {
            video: Some(VideoPortFormat {
                coding: Coding::Mjpeg,
                ..Default::default()
            }),
            audio: None,
        }
    }

    fn packet(pts: i64) -> MuxerPacket<'static> {
        MuxerPacket {
            kind: StreamKind::Video,
            data: &[1, 2, 3],
            pts,
            flags: BufferFlags::KEY_FRAME,
        }
    }

    #[test]
    fn test_file_structure_is_recorded() {
        let factory = MemoryMuxerFactory::new();
        let mut writer = factory
            .create("mem://a.mp4", ContainerFormat::Mp4, &video_only())
            .unwrap();
        assert!(writer.write_packet(packet(0)).is_err(), "packet before header");
        writer.write_header().unwrap();
        assert_eq!(writer.write_packet(packet(0)).unwrap(), WriteStatus::Written);
        writer.write_trailer().unwrap();
        assert!(writer.write_packet(packet(1)).is_err(), "packet after trailer");

        let files = factory.files();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].uri, "mem://a.mp4");
        assert!(files[0].finished);
        assert_eq!(
            files[0].packets,
            vec![RecordedPacket {
                kind: StreamKind::Video,
                pts: 0,
                len: 3
            }]
        );
    }

    #[test]
    fn test_space_limit_reports_no_space() {
        let factory = MemoryMuxerFactory::new();
        let mut writer = factory
            .create("mem://b.mp4", ContainerFormat::Mp4, &video_only())
            .unwrap();
        writer.write_header().unwrap();
        factory.limit_space(Some(1));
        assert_eq!(writer.write_packet(packet(0)).unwrap(), WriteStatus::Written);
        assert_eq!(writer.write_packet(packet(1)).unwrap(), WriteStatus::NoSpace);
        factory.limit_space(None);
        assert_eq!(writer.write_packet(packet(1)).unwrap(), WriteStatus::Written);
        assert_eq!(factory.files()[0].packets.len(), 2);
    }

    #[test]
    fn test_create_needs_uri_and_stream() {
        let factory = MemoryMuxerFactory::new();
        assert!(factory.create("", ContainerFormat::Mp4, &video_only()).is_err());
        assert!(
            factory
                .create("mem://c.mp4", ContainerFormat::Mp4, &MuxerStreams::default())
                .is_err()
        );
        assert!(factory.files().is_empty());
    }
}
