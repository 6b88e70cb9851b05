//! mediasink turns a live, lossy, out-of-order RTP stream carrying
//! compressed media into playable fragmented-MP4 files on disk.
//!
//! The pipeline is: RTP packets enter a [`stream::Stream`] via
//! [`stream::Stream::write_rtp_packet`]; per-format processors reorder
//! packets, reassemble access units, anchor them to wall-clock time and
//! compute decode timestamps; units fan out to any number of readers, each
//! with its own bounded queue and failure domain; a [`recorder::Recorder`]
//! is the canonical reader, rotating ISO-BMFF segment files on key-frame
//! boundaries and restarting itself after upstream failures.
//!
//! Transports (RTSP, WebRTC, ICE/DTLS), signaling and HTTP control planes
//! are out of scope: callers deliver RTP/RTCP packets and media
//! descriptors, mediasink produces files.

pub mod codec;
pub mod config;
pub mod mux;
pub mod recorder;
pub mod rtp;
pub mod stream;
