//! FPGA link transport.
//!
//! A [`Transport`] delivers one control message and returns exactly one
//! decoded reply, or streams bulk instructions to a module. Calls are
//! serialized internally, so a transport can be shared behind an `Arc`
//! between the Device Tree and the Sequencer.

use std::io::{Read, Write};
use std::sync::Arc;

use kosmos_errors::{KosmosResult, TransportError};
use kosmos_protocol::ids::return_code_name;
use kosmos_protocol::{Frame, FrameDecoder, MessageTable, Reply, ReturnCodeReply, cmd, msg_id};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace, warn};

/// Message exchange with the FPGA.
pub trait Transport: Send + Sync {
    /// Send a control request and wait for its reply.
    ///
    /// The reply class is looked up in the installed [`MessageTable`].
    fn send_control(&self, msg_id: u8, cmd_id: u8, payload: &[u8]) -> KosmosResult<Reply>;

    /// Stream instruction words to a module; fails on flow-control rejection.
    fn send_bulk(&self, msg_id: u8, words: &[u32]) -> KosmosResult<()>;

    /// Install the frozen message table built with the Device Tree.
    fn install_table(&self, table: Arc<MessageTable>);
}

/// Interpret the reply frame of a control request.
pub(crate) fn decode_control_reply(
    table: &MessageTable,
    request_id: u8,
    request_cmd: u8,
    frame: Frame,
) -> KosmosResult<Reply> {
    match frame {
        Frame::Control {
            msg_id: msg_id::STATUS,
            payload,
            ..
        } => {
            let rc = ReturnCodeReply::decode(&payload)?;
            if rc.is_success() {
                return Err(TransportError::UnexpectedReply {
                    module_id: request_id,
                    cmd_id: request_cmd,
                    got_id: msg_id::STATUS,
                    got_cmd: rc.cmd_id,
                }
                .into());
            }
            Err(TransportError::ReturnCode {
                module_id: rc.msg_id,
                cmd_id: rc.cmd_id,
                code: rc.code,
                name: return_code_name(rc.code),
            }
            .into())
        }
        Frame::Control {
            msg_id: got_id,
            cmd_id: got_cmd,
            payload,
        } if got_id == request_id && got_cmd == request_cmd | cmd::REPLY_FLAG => {
            let kind = table.reply_kind(request_id, request_cmd)?;
            Ok(Reply::decode(kind, &payload)?)
        }
        other => {
            let got_cmd = match other {
                Frame::Control { cmd_id, .. } => cmd_id,
                _ => 0,
            };
            Err(TransportError::UnexpectedReply {
                module_id: request_id,
                cmd_id: request_cmd,
                got_id: other.msg_id(),
                got_cmd,
            }
            .into())
        }
    }
}

/// Check the acknowledgement of a bulk upload.
pub(crate) fn check_bulk_ack(request_id: u8, frame: &Frame) -> KosmosResult<()> {
    match *frame {
        Frame::BulkAck { msg_id, code: 0 } if msg_id == request_id => Ok(()),
        Frame::BulkAck { msg_id, code } if msg_id == request_id => {
            Err(TransportError::FlowControl {
                module_id: msg_id,
                code,
            }
            .into())
        }
        ref other => Err(TransportError::UnexpectedReply {
            module_id: request_id,
            cmd_id: 0,
            got_id: other.msg_id(),
            got_cmd: 0,
        }
        .into()),
    }
}

struct Link<S> {
    stream: S,
    decoder: FrameDecoder,
}

/// [`Transport`] over any byte stream: a serial port, a TCP socket to the
/// soft-CPU, or a [`mock::MockStream`].
///
/// Read timeouts are those of the underlying stream.
pub struct StreamTransport<S> {
    link: Mutex<Link<S>>,
    table: RwLock<Arc<MessageTable>>,
}

impl<S: Read + Write + Send> StreamTransport<S> {
    pub fn new(stream: S) -> Self {
        Self {
            link: Mutex::new(Link {
                stream,
                decoder: FrameDecoder::new(),
            }),
            table: RwLock::new(Arc::new(MessageTable::default())),
        }
    }

    fn write_frame(link: &mut Link<S>, frame: &Frame) -> KosmosResult<()> {
        let bytes = frame.encode()?;
        link.stream.write_all(&bytes)?;
        link.stream.flush()?;
        trace!(len = bytes.len(), "frame written");
        Ok(())
    }

    fn read_frame(link: &mut Link<S>, table: &MessageTable) -> KosmosResult<Frame> {
        let mut chunk = [0u8; 256];
        loop {
            match link.decoder.next_frame(|id| table.inst_width(id)) {
                Ok(Some(frame)) => return Ok(frame),
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, pending = link.decoder.pending(), "dropping corrupt input");
                    link.decoder.clear();
                    return Err(e.into());
                }
            }
            let n = link.stream.read(&mut chunk)?;
            if n == 0 {
                return Err(TransportError::Closed.into());
            }
            link.decoder.push(chunk.get(..n).unwrap_or_default());
        }
    }
}

impl<S: Read + Write + Send> Transport for StreamTransport<S> {
    fn send_control(&self, msg_id: u8, cmd_id: u8, payload: &[u8]) -> KosmosResult<Reply> {
        let table = Arc::clone(&self.table.read());
        // Fail before touching the link when the reply class is unknown.
        table.reply_kind(msg_id, cmd_id)?;
        let request = Frame::control(msg_id, cmd_id, payload)?;

        let mut link = self.link.lock();
        debug!(msg_id, cmd_id, len = payload.len(), "control request");
        Self::write_frame(&mut link, &request)?;
        let frame = Self::read_frame(&mut link, &table)?;
        decode_control_reply(&table, msg_id, cmd_id, frame)
    }

    fn send_bulk(&self, msg_id: u8, words: &[u32]) -> KosmosResult<()> {
        let table = Arc::clone(&self.table.read());
        let request = Frame::bulk_words(msg_id, words)?;

        let mut link = self.link.lock();
        debug!(msg_id, count = words.len(), "bulk upload");
        Self::write_frame(&mut link, &request)?;
        let frame = Self::read_frame(&mut link, &table)?;
        check_bulk_ack(msg_id, &frame)
    }

    fn install_table(&self, table: Arc<MessageTable>) {
        *self.table.write() = table;
    }
}

pub mod mock {
    //! In-memory byte stream for exercising [`StreamTransport`](super::StreamTransport).

    use std::collections::VecDeque;
    use std::io::{self, Read, Write};
    use std::sync::Arc;

    use kosmos_protocol::table::INSTRUCTION_WIDTH;
    use kosmos_protocol::{Frame, FrameDecoder};
    use parking_lot::Mutex;

    type Responder = Box<dyn FnMut(Frame) -> Vec<Frame> + Send>;

    #[derive(Default)]
    struct MockInner {
        rx: VecDeque<u8>,
        written: Vec<u8>,
        decoder: FrameDecoder,
        responder: Option<Responder>,
    }

    /// Byte stream with scripted or computed replies.
    ///
    /// Clones share the same buffers, so a test can keep one handle while
    /// the transport owns another. Reading an empty stream fails with
    /// [`io::ErrorKind::TimedOut`].
    #[derive(Clone, Default)]
    pub struct MockStream {
        inner: Arc<Mutex<MockInner>>,
    }

    impl MockStream {
        pub fn new() -> Self {
            Self::default()
        }

        /// Answer every frame written by the host with `responder`.
        pub fn with_responder(responder: impl FnMut(Frame) -> Vec<Frame> + Send + 'static) -> Self {
            let stream = Self::new();
            stream.inner.lock().responder = Some(Box::new(responder));
            stream
        }

        /// Queue a frame for the host to read.
        pub fn queue_frame(&self, frame: &Frame) -> io::Result<()> {
            let bytes = frame
                .encode()
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
            self.queue_bytes(&bytes);
            Ok(())
        }

        /// Queue raw bytes, e.g. a corrupted frame.
        pub fn queue_bytes(&self, bytes: &[u8]) {
            self.inner.lock().rx.extend(bytes.iter().copied());
        }

        /// Every byte written by the host so far.
        pub fn written(&self) -> Vec<u8> {
            self.inner.lock().written.clone()
        }

        /// Frames written by the host so far, decoded.
        pub fn written_frames(&self) -> Vec<Frame> {
            let mut decoder = FrameDecoder::new();
            decoder.push(&self.written());
            let mut frames = Vec::new();
            while let Ok(Some(frame)) = decoder.next_frame(|_| Some(INSTRUCTION_WIDTH)) {
                frames.push(frame);
            }
            frames
        }

        /// Bytes still waiting to be read by the host.
        pub fn pending(&self) -> usize {
            self.inner.lock().rx.len()
        }
    }

    impl Read for MockStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let mut inner = self.inner.lock();
            if inner.rx.is_empty() {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "no reply queued"));
            }
            let n = buf.len().min(inner.rx.len());
            for (dst, src) in buf.iter_mut().zip(inner.rx.drain(..n)) {
                *dst = src;
            }
            Ok(n)
        }
    }

    impl Write for MockStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let mut inner = self.inner.lock();
            inner.written.extend_from_slice(buf);
            if inner.responder.is_none() {
                return Ok(buf.len());
            }
            inner.decoder.push(buf);
            loop {
                let frame = match inner.decoder.next_frame(|_| Some(INSTRUCTION_WIDTH)) {
                    Ok(Some(frame)) => frame,
                    Ok(None) => break,
                    Err(e) => {
                        inner.decoder.clear();
                        return Err(io::Error::new(io::ErrorKind::InvalidData, e.to_string()));
                    }
                };
                let replies = match inner.responder.as_mut() {
                    Some(responder) => responder(frame),
                    None => Vec::new(),
                };
                for reply in replies {
                    let bytes = reply
                        .encode()
                        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
                    inner.rx.extend(bytes);
                }
            }
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }
}
