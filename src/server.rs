//! Network Block Device server core: the fixed-newstyle handshake, the
//! transmission request loop, and the per-connection supervisor.
//!
//! The engine is strictly serial within a session: one request is read in
//! full, the backend call runs synchronously, one reply is written, and
//! only then is the next request read. Recoverable protocol errors are
//! answered in-band and never desynchronise the stream; everything else
//! unwinds to the supervisor, which closes the transport and the backend.
//!
//! See <https://github.com/NetworkBlockDevice/nbd/blob/master/doc/proto.md> for
//! the protocol description.

#![deny(missing_docs)]
use color_eyre::eyre::{bail, WrapErr};
use color_eyre::Result;

use std::io::prelude::*;
use std::net::{TcpListener, ToSocketAddrs};
use std::sync::Arc;
use std::thread;

use byteorder::{ReadBytesExt, WriteBytesExt, BE};
use log::{info, warn};

use crate::backend::{Backend, BackendFactory, ExportInfo};
use crate::proto::*;

// agree on basic negotiation flags (only fixed newstyle is supported, and
// clients still sending the deprecated flag set are refused)
fn initial_handshake<IO: Read + Write>(stream: &mut IO) -> Result<()> {
    stream.write_u64::<BE>(MAGIC)?;
    stream.write_u64::<BE>(IHAVEOPT)?;
    stream.write_u16::<BE>((HandshakeFlags::FIXED_NEWSTYLE | HandshakeFlags::NO_ZEROES).bits())?;
    stream.flush()?;
    let client_flags = stream.read_u32::<BE>()?;
    let client_flags = ClientHandshakeFlags::from_bits(client_flags)
        .ok_or_else(|| ProtocolError::new(format!("unexpected client flags {client_flags:#x}")))?;
    if client_flags != (ClientHandshakeFlags::C_FIXED_NEWSTYLE | ClientHandshakeFlags::C_NO_ZEROES)
    {
        bail!(ProtocolError::new(format!(
            "refusing deprecated client flags {client_flags:?}"
        )));
    }
    Ok(())
}

// Reply to a successful INFO/GO: the mandatory export info first, then the
// client's requested items in its order, then an ack.
fn info_responses<IO: Write>(
    option: u32,
    export: &ExportInfo,
    req: &InfoRequest,
    stream: &mut IO,
) -> Result<()> {
    OptReply::info(
        option,
        &InfoReply::Export {
            size: export.size,
            flags: TransmitFlags::empty().bits(),
        },
    )?
    .put(&mut *stream)?;
    for &item in &req.reqs {
        match InfoType::try_from(item) {
            Ok(InfoType::EXPORT) => {
                // mandatory information, already sent above
            }
            Ok(InfoType::NAME) => {
                OptReply::info(option, &InfoReply::Name(export.name.clone()))?
                    .put(&mut *stream)?;
            }
            Ok(InfoType::DESCRIPTION) => {
                OptReply::info(option, &InfoReply::Description(export.description.clone()))?
                    .put(&mut *stream)?;
            }
            Ok(InfoType::BLOCK_SIZE) => {
                OptReply::info(
                    option,
                    &InfoReply::BlockSize {
                        min: export.block_size,
                        preferred: export.block_size,
                        max: export.block_size,
                    },
                )?
                .put(&mut *stream)?;
            }
            Err(_) => {
                // unrecognised info requests are ignored
            }
        }
    }
    OptReply::ack(option).put(&mut *stream)?;
    Ok(())
}

/// After the initial handshake, "haggle" over options until the client
/// either selects an export with GO or gives up.
///
/// `Ok(None)` means the client aborted and the session ends cleanly
/// without a transmission phase.
fn handshake_haggle<B: Backend, IO: Read + Write>(
    backend: &B,
    stream: &mut IO,
) -> Result<Option<ExportInfo>> {
    loop {
        let opt = Opt::get(&mut *stream)?;
        match opt.body {
            OptBody::Refused(err) => {
                warn!(target: "nbd", "refusing option {}: {:?}", opt.option, err);
                OptReply::error(opt.option, err).put(&mut *stream)?;
                if opt.option == u32::from(OptType::ABORT) {
                    return Ok(None);
                }
            }
            // the only difference between INFO and GO is that on success,
            // GO starts the transmission phase
            OptBody::Info(req) => match backend.info(&req.name) {
                Ok(export) => info_responses(opt.option, &export, &req, stream)?,
                Err(err) => OptReply::error(opt.option, err).put(&mut *stream)?,
            },
            OptBody::Go(req) => match backend.info(&req.name) {
                Ok(export) => {
                    info_responses(opt.option, &export, &req, stream)?;
                    return Ok(Some(export));
                }
                Err(err) => OptReply::error(opt.option, err).put(&mut *stream)?,
            },
        }
    }
}

fn handle_ops<B: Backend, IO: Read + Write>(backend: &mut B, stream: &mut IO) -> Result<()> {
    loop {
        let req = match Request::get(&mut *stream)? {
            ReqFrame::Valid(req) => req,
            ReqFrame::Malformed { handle, errno } => {
                warn!(target: "nbd", "malformed request with handle {handle:#x}: {errno:?}");
                SimpleReply::err_handle(errno, handle).put(&mut *stream)?;
                continue;
            }
        };
        info!(target: "nbd", "{:?}", req);
        match req.typ {
            Cmd::READ => {
                if req.len == 0 {
                    SimpleReply::err(ErrorType::EINVAL, &req).put(&mut *stream)?;
                    continue;
                }
                match backend.read(req.offset, req.len) {
                    Ok(data) => SimpleReply::data(&req, data).put(&mut *stream)?,
                    Err(err) => {
                        warn!(target: "nbd", "read error {:?}", err);
                        SimpleReply::err(err, &req).put(&mut *stream)?;
                    }
                }
            }
            Cmd::WRITE => {
                if req.len == 0 {
                    SimpleReply::err(ErrorType::EINVAL, &req).put(&mut *stream)?;
                    continue;
                }
                match backend.write(req.offset, &req.data) {
                    Ok(()) => SimpleReply::ok(&req).put(&mut *stream)?,
                    Err(err) => {
                        warn!(target: "nbd", "write error {:?}", err);
                        SimpleReply::err(err, &req).put(&mut *stream)?;
                    }
                }
            }
            Cmd::DISCONNECT => {
                // no reply: the client tears the connection down immediately
                return Ok(());
            }
            Cmd::FLUSH => {
                if req.len != 0 || req.offset != 0 {
                    SimpleReply::err(ErrorType::EINVAL, &req).put(&mut *stream)?;
                    continue;
                }
                match backend.flush() {
                    Ok(()) => SimpleReply::ok(&req).put(&mut *stream)?,
                    Err(err) => {
                        warn!(target: "nbd", "flush error {:?}", err);
                        SimpleReply::err(err, &req).put(&mut *stream)?;
                    }
                }
            }
            // TRIM, CACHE, WRITE_ZEROES, BLOCK_STATUS, RESIZE
            _ => {
                SimpleReply::err(ErrorType::EINVAL, &req).put(&mut *stream)?;
            }
        }
    }
}

/// Run a whole session (handshake, then transmission) against `backend`
/// over `stream`.
///
/// Returns `Ok(())` when the client disconnects gracefully, whether during
/// the handshake or after it. The caller closes the backend afterwards.
pub fn handle_client<B: Backend, IO: Read + Write>(backend: &mut B, mut stream: IO) -> Result<()> {
    initial_handshake(&mut stream).wrap_err("initial handshake failed")?;
    if let Some(export) =
        handshake_haggle(&*backend, &mut stream).wrap_err("handshake haggling failed")?
    {
        info!(target: "nbd", "handshake finished for export {:?}", export.name);
        handle_ops(backend, &mut stream).wrap_err("handling client operations")?;
    }
    Ok(())
}

/// Accepts connections and serves each one on its own thread, against a
/// backend obtained from the factory for that connection.
#[derive(Debug)]
pub struct Server<F> {
    factory: F,
}

impl<F> Server<F>
where
    F: BackendFactory + Send + Sync + 'static,
    F::Backend: Send,
{
    /// Create a server that asks `factory` for one backend per connection.
    pub fn new(factory: F) -> Self {
        Self { factory }
    }

    /// Start accepting connections from clients and processing commands.
    ///
    /// Session errors are logged here and not propagated; by the time they
    /// surface the stream is already gone.
    pub fn start<A: ToSocketAddrs>(self, addr: A) -> Result<()> {
        let listener = TcpListener::bind(addr)?;
        let factory = Arc::new(self.factory);
        for stream in listener.incoming() {
            let stream = stream?;
            stream.set_nodelay(true)?;
            let peer = stream.peer_addr()?;
            info!(target: "nbd", "client connected from {peer}");
            let factory = Arc::clone(&factory);
            thread::spawn(move || {
                let mut backend = factory.new_client(peer);
                match handle_client(&mut backend, stream) {
                    Ok(()) => info!(target: "nbd", "client {peer} disconnected"),
                    Err(err) => warn!(target: "nbd", "error handling client {peer}: {err:#}"),
                }
                // every exit path funnels through here, once
                backend.close();
            });
        }
        Ok(())
    }
}
