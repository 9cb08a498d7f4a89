//! NBD protocol constants and message framing.
//!
//! Everything on the wire is big-endian. The handshake phase exchanges
//! length-prefixed option messages; the transmission phase exchanges fixed
//! headers with an optional payload. Decoders distinguish recoverable
//! failures (returned as values, with the offending payload fully consumed
//! so the stream stays frame-aligned) from stream-fatal ones (surfaced as
//! errors that unwind the session).
//!
//! See <https://github.com/NetworkBlockDevice/nbd/blob/master/doc/proto.md> for
//! the protocol description.
#![allow(clippy::upper_case_acronyms)]
#![allow(non_camel_case_types)]
use color_eyre::eyre::{bail, ensure, WrapErr};
use color_eyre::Result;
use log::warn;
use std::error::Error;
use std::fmt;
use std::io::{self, prelude::*, ErrorKind};

use bitflags::bitflags;
use byteorder::{ReadBytesExt, WriteBytesExt, BE};
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Default NBD port.
pub const TCP_PORT: u16 = 10809;

pub const MAGIC: u64 = 0x4e42444d41474943; // b"NBDMAGIC"
pub const IHAVEOPT: u64 = 0x49484156454F5054; // b"IHAVEOPT"
pub const REPLY_MAGIC: u64 = 0x0003e889045565a9;

// transmission constants
pub const REQUEST_MAGIC: u32 = 0x25609513;
pub const SIMPLE_REPLY_MAGIC: u32 = 0x67446698;
pub const STRUCTURED_REPLY_MAGIC: u32 = 0x668e33ef;

/// Longest option payload the server will buffer; anything larger is
/// discarded and answered with `TOO_BIG`.
pub const MAX_OPTION_LENGTH: u32 = 4 << 10;

/// Longest write payload accepted in the transmission phase.
pub const MAX_WRITE_LENGTH: u32 = 4 << 20;

/// A protocol violation that cannot be answered in-band. Reaching one of
/// these fails the whole session.
#[derive(Debug, Clone)]
pub struct ProtocolError(String);

impl ProtocolError {
    pub fn new<S: AsRef<str>>(s: S) -> Self {
        ProtocolError(s.as_ref().to_string())
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "nbd protocol error: {}", self.0)?;
        Ok(())
    }
}

impl Error for ProtocolError {}

bitflags! {
  pub struct HandshakeFlags: u16 {
    const FIXED_NEWSTYLE = 0b01;
    const NO_ZEROES = 0b10;
  }

  pub struct ClientHandshakeFlags: u32 {
    const C_FIXED_NEWSTYLE = 0b01;
    const C_NO_ZEROES = 0b10;
  }

  pub struct TransmitFlags: u16 {
    const HAS_FLAGS = 1 << 0;
    const READ_ONLY = 1 << 1;
    const SEND_FLUSH = 1 << 2;
    const SEND_FUA = 1 << 3;
    const ROTATIONAL = 1 << 4;
    const SEND_TRIM = 1 << 5;
    const SEND_WRITE_ZEROES = 1 << 6;
    const SEND_DF = 1 << 7;
    const CAN_MULTI_CONN = 1 << 8;
    const SEND_RESIZE = 1 << 9;
    const SEND_CACHE = 1 << 10;
    const SEND_FAST_ZERO = 1 << 11;
  }
}

/// Option codes sent by the client during the handshake.
#[derive(IntoPrimitive, TryFromPrimitive, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub enum OptType {
    EXPORT_NAME = 1,
    ABORT = 2,
    LIST = 3,
    STARTTLS = 5,
    INFO = 6,
    GO = 7,
    STRUCTURED_REPLY = 8,
    LIST_META_CONTEXT = 9,
    SET_META_CONTEXT = 10,
}

/// Info item codes carried in `INFO`/`GO` payloads and echoed in info
/// replies.
#[derive(IntoPrimitive, TryFromPrimitive, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u16)]
pub enum InfoType {
    EXPORT = 0,
    NAME = 1,
    DESCRIPTION = 2,
    BLOCK_SIZE = 3,
}

/// Non-error option reply codes.
#[derive(IntoPrimitive, TryFromPrimitive, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub enum ReplyType {
    ACK = 1,
    SERVER = 2,
    INFO = 3,
}

/// Option-negotiation error codes (the reply-code field with the high bit
/// set). Distinct from [`ErrorType`], which is the transmission-phase
/// error space; the two must not be mixed.
#[derive(IntoPrimitive, TryFromPrimitive, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub enum OptError {
    UNSUP = (1 << 31) + 1,
    POLICY = (1 << 31) + 2,
    INVALID = (1 << 31) + 3,
    PLATFORM = (1 << 31) + 4,
    TLS_REQD = (1 << 31) + 5,
    UNKNOWN = (1 << 31) + 6,
    SHUTDOWN = (1 << 31) + 7,
    BLOCK_SIZE_REQD = (1 << 31) + 8,
    TOO_BIG = (1 << 31) + 9,
}

/// Consume and drop exactly `n` bytes so the stream stays frame-aligned.
fn discard<IO: Read>(stream: &mut IO, n: u32) -> io::Result<()> {
    let n = u64::from(n);
    let copied = io::copy(&mut stream.by_ref().take(n), &mut io::sink())?;
    if copied != n {
        return Err(io::Error::from(ErrorKind::UnexpectedEof));
    }
    Ok(())
}

/// Payload of an `INFO`/`GO` option: the requested export name plus the
/// info items the client wants, in its order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoRequest {
    pub name: String,
    /// Raw info item codes; unrecognised ones are ignored when replying.
    pub reqs: Vec<u16>,
}

impl InfoRequest {
    // The payload layout is:
    //
    //   32 bits, length of name (unsigned); MUST be no larger than the
    //       option data length - 6
    //   String: name of the export
    //   16 bits, number of information requests
    //   16 bits x n - list of NBD_INFO information requests
    fn parse(data: &[u8]) -> core::result::Result<Self, OptError> {
        let len = data.len();
        if len < 6 {
            return Err(OptError::INVALID);
        }
        let mut rest = data;
        let name_len = rest.read_u32::<BE>().map_err(|_| OptError::INVALID)? as usize;
        if name_len > len - 6 || (len - name_len - 6) % 2 != 0 {
            return Err(OptError::INVALID);
        }
        let mut name = vec![0u8; name_len];
        rest.read_exact(&mut name).map_err(|_| OptError::INVALID)?;
        let name = String::from_utf8(name).map_err(|_| OptError::INVALID)?;
        let num_reqs = rest.read_u16::<BE>().map_err(|_| OptError::INVALID)?;
        if (len - name_len - 6) / 2 != num_reqs as usize {
            return Err(OptError::INVALID);
        }
        let mut reqs = Vec::with_capacity(num_reqs as usize);
        for _ in 0..num_reqs {
            reqs.push(rest.read_u16::<BE>().map_err(|_| OptError::INVALID)?);
        }
        Ok(InfoRequest { name, reqs })
    }

    /// Encode as the payload of `option` and write the whole option frame.
    /// This is the client half of [`Opt::get`], used by tests.
    pub fn put<IO: Write>(&self, option: OptType, mut stream: IO) -> io::Result<()> {
        stream.write_u64::<BE>(IHAVEOPT)?;
        stream.write_u32::<BE>(option.into())?;
        let len = 4 + self.name.len() + 2 + 2 * self.reqs.len();
        stream.write_u32::<BE>(len as u32)?;
        stream.write_u32::<BE>(self.name.len() as u32)?;
        stream.write_all(self.name.as_bytes())?;
        stream.write_u16::<BE>(self.reqs.len() as u16)?;
        for &r in &self.reqs {
            stream.write_u16::<BE>(r)?;
        }
        stream.flush()?;
        Ok(())
    }
}

/// One option request, decoded. `option` is the code exactly as the client
/// sent it and is echoed in every reply to the option.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Opt {
    pub option: u32,
    pub body: OptBody,
}

/// What the option turned out to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptBody {
    Info(InfoRequest),
    Go(InfoRequest),
    /// An option we answer with an error reply: unknown or unsupported
    /// codes, oversized payloads, malformed `INFO`/`GO` payloads. The
    /// payload has been consumed in full; the stream is still aligned.
    Refused(OptError),
}

impl Opt {
    /// Decode one option.
    ///
    /// Only I/O failures and a bad option magic are errors here; anything
    /// the protocol lets us answer in-band comes back as
    /// [`OptBody::Refused`].
    pub fn get<IO: Read>(mut stream: IO) -> Result<Self> {
        // C: 64 bits, 0x49484156454F5054 (ASCII 'IHAVEOPT') (note same newstyle handshake's magic number)
        // C: 32 bits, option
        // C: 32 bits, length of option data (unsigned)
        // C: any data needed for the chosen option, of length as specified above.
        let magic = stream.read_u64::<BE>()?;
        if magic != IHAVEOPT {
            bail!(ProtocolError::new(format!(
                "unexpected option magic {magic:#x}"
            )));
        }
        let option = stream.read_u32::<BE>()?;
        let option_len = stream.read_u32::<BE>()?;
        if option_len > MAX_OPTION_LENGTH {
            discard(&mut stream, option_len)?;
            return Ok(Self {
                option,
                body: OptBody::Refused(OptError::TOO_BIG),
            });
        }
        let mut data = vec![0u8; option_len as usize];
        stream
            .read_exact(&mut data)
            .wrap_err_with(|| format!("reading option {option} of size {option_len}"))?;
        let body = match OptType::try_from(option) {
            Ok(OptType::INFO) => match InfoRequest::parse(&data) {
                Ok(req) => OptBody::Info(req),
                Err(err) => OptBody::Refused(err),
            },
            Ok(OptType::GO) => match InfoRequest::parse(&data) {
                Ok(req) => OptBody::Go(req),
                Err(err) => OptBody::Refused(err),
            },
            // recognised but not implemented, or not recognised at all
            Ok(_) | Err(_) => OptBody::Refused(OptError::UNSUP),
        };
        Ok(Self { option, body })
    }
}

/// Typed payload of an `INFO` option reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InfoReply {
    Export { size: u64, flags: u16 },
    Name(String),
    Description(String),
    BlockSize { min: u32, preferred: u32, max: u32 },
}

impl InfoReply {
    fn put<IO: Write>(&self, mut stream: IO) -> io::Result<()> {
        match self {
            InfoReply::Export { size, flags } => {
                stream.write_u16::<BE>(InfoType::EXPORT.into())?;
                stream.write_u64::<BE>(*size)?;
                stream.write_u16::<BE>(*flags)?;
            }
            InfoReply::Name(name) => {
                stream.write_u16::<BE>(InfoType::NAME.into())?;
                stream.write_all(name.as_bytes())?;
            }
            InfoReply::Description(description) => {
                stream.write_u16::<BE>(InfoType::DESCRIPTION.into())?;
                stream.write_all(description.as_bytes())?;
            }
            InfoReply::BlockSize {
                min,
                preferred,
                max,
            } => {
                stream.write_u16::<BE>(InfoType::BLOCK_SIZE.into())?;
                stream.write_u32::<BE>(*min)?;
                stream.write_u32::<BE>(*preferred)?;
                stream.write_u32::<BE>(*max)?;
            }
        }
        Ok(())
    }

    /// Parse an `INFO` reply payload (the loopback/test half of encoding).
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut rest = data;
        let typ = rest.read_u16::<BE>()?;
        let typ = InfoType::try_from(typ)
            .map_err(|_| ProtocolError::new(format!("unknown info type {typ}")))?;
        match typ {
            InfoType::EXPORT => {
                ensure!(
                    rest.len() == 10,
                    ProtocolError::new("invalid length for export info")
                );
                let size = rest.read_u64::<BE>()?;
                let flags = rest.read_u16::<BE>()?;
                Ok(InfoReply::Export { size, flags })
            }
            InfoType::NAME => {
                ensure!(
                    rest.len() <= MAX_OPTION_LENGTH as usize,
                    ProtocolError::new("name too large")
                );
                let name = String::from_utf8(rest.to_vec())
                    .wrap_err(ProtocolError::new("non-UTF8 export name"))?;
                Ok(InfoReply::Name(name))
            }
            InfoType::DESCRIPTION => {
                ensure!(
                    rest.len() <= MAX_OPTION_LENGTH as usize,
                    ProtocolError::new("description too large")
                );
                let description = String::from_utf8(rest.to_vec())
                    .wrap_err(ProtocolError::new("non-UTF8 description"))?;
                Ok(InfoReply::Description(description))
            }
            InfoType::BLOCK_SIZE => {
                ensure!(
                    rest.len() == 12,
                    ProtocolError::new("invalid length for block size info")
                );
                let min = rest.read_u32::<BE>()?;
                let preferred = rest.read_u32::<BE>()?;
                let max = rest.read_u32::<BE>()?;
                Ok(InfoReply::BlockSize {
                    min,
                    preferred,
                    max,
                })
            }
        }
    }
}

/// Builder for replying to an option.
#[must_use]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptReply {
    pub option: u32,
    pub code: u32,
    pub data: Vec<u8>,
}

impl OptReply {
    pub fn ack(option: u32) -> Self {
        Self {
            option,
            code: ReplyType::ACK.into(),
            data: vec![],
        }
    }

    pub fn error(option: u32, err: OptError) -> Self {
        Self {
            option,
            code: err.into(),
            data: vec![],
        }
    }

    /// An `INFO` reply. The payload is rendered into a side buffer first
    /// because its length precedes it on the wire.
    pub fn info(option: u32, info: &InfoReply) -> io::Result<Self> {
        let mut data = vec![];
        info.put(&mut data)?;
        Ok(Self {
            option,
            code: ReplyType::INFO.into(),
            data,
        })
    }

    pub fn put<IO: Write>(self, mut stream: IO) -> io::Result<()> {
        // S: 64 bits, 0x3e889045565a9 (magic number for replies)
        // S: 32 bits, the option as sent by the client to which this is a reply
        // S: 32 bits, reply type (e.g., NBD_REP_ACK for successful completion, or NBD_REP_ERR_UNSUP to mark use of an option not known by this server
        // S: 32 bits, length of the reply. This MAY be zero for some replies, in which case the next field is not sent
        // S: any data as required by the reply (e.g., an export name in the case of NBD_REP_SERVER)
        stream.write_u64::<BE>(REPLY_MAGIC)?;
        stream.write_u32::<BE>(self.option)?;
        stream.write_u32::<BE>(self.code)?;
        stream.write_u32::<BE>(self.data.len() as u32)?;
        stream.write_all(&self.data)?;
        stream.flush()?;
        Ok(())
    }

    /// Read one option reply (the loopback/test half of `put`).
    pub fn get<IO: Read>(mut stream: IO) -> Result<Self> {
        let magic = stream.read_u64::<BE>()?;
        if magic != REPLY_MAGIC {
            bail!(ProtocolError::new(format!(
                "unexpected reply magic {magic:#x}"
            )));
        }
        let option = stream.read_u32::<BE>()?;
        let code = stream.read_u32::<BE>()?;
        let len = stream.read_u32::<BE>()?;
        ensure!(
            len <= MAX_OPTION_LENGTH,
            ProtocolError::new(format!("reply length {len} is too large"))
        );
        let mut data = vec![0u8; len as usize];
        stream.read_exact(&mut data)?;
        if code == u32::from(ReplyType::ACK) && !data.is_empty() {
            bail!(ProtocolError::new("invalid ack reply"));
        }
        Ok(Self { option, code, data })
    }
}

// -------------------
// Transmission phase
// -------------------

/// Transmission-phase command codes.
#[derive(IntoPrimitive, TryFromPrimitive, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u16)]
pub enum Cmd {
    READ = 0,
    WRITE = 1,
    // NBD_CMD_DISC
    DISCONNECT = 2,
    FLUSH = 3,
    TRIM = 4,
    CACHE = 5,
    WRITE_ZEROES = 6,
    BLOCK_STATUS = 7,
    RESIZE = 8,
}

bitflags! {
    pub struct CmdFlags: u16 {
        const FUA = 1 << 0;
        const NO_HOLE = 1 << 1;
        // "don't fragment"
        const DF = 1 << 2;
        const REQ_ONE = 1 << 3;
        const FAST_ZERO = 1 << 4;
    }
}

/// Transmission-phase error numbers carried in simple replies. These are
/// POSIX-style and disjoint from the option error space ([`OptError`]);
/// the two must not be confused at the backend boundary.
#[derive(IntoPrimitive, TryFromPrimitive, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorType {
    OK = 0,
    EPERM = 1,
    EIO = 5,
    ENOMEM = 12,
    EINVAL = 22,
    ENOSPC = 28,
    EOVERFLOW = 75,
    ENOTSUP = 95,
    ESHUTDOWN = 108,
}

impl ErrorType {
    pub fn from_io_kind(kind: io::ErrorKind) -> Self {
        match kind {
            ErrorKind::PermissionDenied => Self::EPERM,
            ErrorKind::InvalidInput => Self::EOVERFLOW,
            ErrorKind::UnexpectedEof => Self::EOVERFLOW,
            _ => {
                warn!("unexpected error {}", kind);
                Self::EIO
            }
        }
    }
}

/// A transmission-phase request.
pub struct Request {
    pub flags: CmdFlags,
    pub typ: Cmd,
    pub handle: u64,
    pub offset: u64,
    // used for READ (redundant for WRITE)
    pub len: u32,
    // only populated for WRITE
    pub data: Vec<u8>,
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = &mut f.debug_struct("Request");
        if !self.flags.is_empty() {
            f = f.field("flags", &self.flags);
        }
        f = f.field("typ", &self.typ);
        if self.typ == Cmd::READ
            || self.typ == Cmd::WRITE
            || self.typ == Cmd::TRIM
            || self.typ == Cmd::CACHE
        {
            f = f.field("offset", &self.offset);
        }
        if self.len != 0 {
            f = f.field("len", &self.len);
        }
        f.finish_non_exhaustive()
    }
}

/// A request frame as read from the wire: either well-formed, or malformed
/// in a way that left the stream aligned and can be answered in-band.
#[derive(Debug)]
pub enum ReqFrame {
    Valid(Request),
    Malformed { handle: u64, errno: ErrorType },
}

impl Request {
    /// Decode one request. A wrong magic is fatal; a header that decodes
    /// but describes a request we refuse (offset with the top bit set,
    /// oversized write, unknown command) comes back as
    /// [`ReqFrame::Malformed`] with the payload, if any, discarded.
    pub fn get<IO: Read>(mut stream: IO) -> Result<ReqFrame> {
        // C: 32 bits, 0x25609513, magic (NBD_REQUEST_MAGIC)
        // C: 16 bits, command flags
        // C: 16 bits, type
        // C: 64 bits, handle
        // C: 64 bits, offset (unsigned)
        // C: 32 bits, length (unsigned)
        // C: (length bytes of data if the request is of type NBD_CMD_WRITE)
        let magic = stream.read_u32::<BE>()?;
        if magic != REQUEST_MAGIC {
            bail!(ProtocolError::new(format!("wrong request magic {}", magic)));
        }
        let flags = CmdFlags::from_bits_truncate(stream.read_u16::<BE>()?);
        let typ = stream.read_u16::<BE>()?;
        let handle = stream.read_u64::<BE>()?;
        let offset = stream.read_u64::<BE>()?;
        let len = stream.read_u32::<BE>()?;
        if offset & (1 << 63) != 0 {
            // the client is buggy or attempting an overflow; nothing past
            // the header is consumed
            return Ok(ReqFrame::Malformed {
                handle,
                errno: ErrorType::EOVERFLOW,
            });
        }
        let typ = match Cmd::try_from(typ) {
            Ok(typ) => typ,
            Err(_) => {
                return Ok(ReqFrame::Malformed {
                    handle,
                    errno: ErrorType::EINVAL,
                })
            }
        };
        let data = if typ == Cmd::WRITE {
            if len > MAX_WRITE_LENGTH {
                discard(&mut stream, len)?;
                return Ok(ReqFrame::Malformed {
                    handle,
                    errno: ErrorType::EOVERFLOW,
                });
            }
            let mut buf = vec![0u8; len as usize];
            stream
                .read_exact(&mut buf)
                .wrap_err_with(|| format!("parsing write request of length {len}"))?;
            buf
        } else {
            vec![]
        };
        Ok(ReqFrame::Valid(Self {
            flags,
            typ,
            handle,
            offset,
            len,
            data,
        }))
    }

    /// Client-side constructor, used by tests.
    pub fn new(typ: Cmd, handle: u64, offset: u64, len: u32) -> Self {
        Self {
            flags: CmdFlags::empty(),
            typ,
            handle,
            offset,
            len,
            data: vec![],
        }
    }

    /// Client-side encoding, used by tests. `data` is written after the
    /// header for WRITE requests.
    pub fn put<IO: Write>(&self, data: &[u8], mut stream: IO) -> io::Result<()> {
        stream.write_u32::<BE>(REQUEST_MAGIC)?;
        stream.write_u16::<BE>(self.flags.bits())?;
        stream.write_u16::<BE>(self.typ.into())?;
        stream.write_u64::<BE>(self.handle)?;
        stream.write_u64::<BE>(self.offset)?;
        stream.write_u32::<BE>(self.len)?;
        stream.write_all(data)?;
        stream.flush()?;
        Ok(())
    }
}

/// The non-structured transmission-phase reply.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub struct SimpleReply {
    pub err: ErrorType,
    pub handle: u64,
    pub data: Vec<u8>,
}

impl SimpleReply {
    pub fn data(req: &Request, data: Vec<u8>) -> Self {
        SimpleReply {
            err: ErrorType::OK,
            handle: req.handle,
            data,
        }
    }

    pub fn ok(req: &Request) -> Self {
        Self::data(req, vec![])
    }

    pub fn err(err: ErrorType, req: &Request) -> Self {
        SimpleReply {
            err,
            handle: req.handle,
            data: vec![],
        }
    }

    /// Error reply for a request that never decoded far enough to have a
    /// [`Request`] value.
    pub fn err_handle(err: ErrorType, handle: u64) -> Self {
        SimpleReply {
            err,
            handle,
            data: vec![],
        }
    }

    pub fn put<IO: Write>(self, mut stream: IO) -> io::Result<()> {
        stream.write_u32::<BE>(SIMPLE_REPLY_MAGIC)?;
        stream.write_u32::<BE>(self.err.into())?;
        stream.write_u64::<BE>(self.handle)?;
        stream.write_all(&self.data)?;
        Ok(())
    }

    /// Read one simple reply (the loopback/test half of `put`). `data_len`
    /// is the length of the originating READ, or zero for any other
    /// command; an error reply never carries data.
    pub fn get<IO: Read>(mut stream: IO, data_len: u32) -> Result<Self> {
        let magic = stream.read_u32::<BE>()?;
        if magic != SIMPLE_REPLY_MAGIC {
            bail!(ProtocolError::new(format!(
                "unexpected reply magic {magic:#x}"
            )));
        }
        let err = stream.read_u32::<BE>()?;
        let err = ErrorType::try_from(err)
            .map_err(|_| ProtocolError::new(format!("unknown error number {err}")))?;
        let handle = stream.read_u64::<BE>()?;
        let len = if err == ErrorType::OK { data_len } else { 0 };
        let mut data = vec![0u8; len as usize];
        stream.read_exact(&mut data)?;
        Ok(Self { err, handle, data })
    }
}
