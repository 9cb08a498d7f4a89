//! Message framing tests: golden byte fixtures, encode/decode round-trips,
//! and frame alignment after every recoverable decode error.

use std::io::Cursor;

use byteorder::{WriteBytesExt, BE};
use color_eyre::Result;

use nbd_server::proto::*;

/// Write a raw option frame, bypassing the typed encoder.
fn put_raw_opt(buf: &mut Vec<u8>, option: u32, payload: &[u8]) {
    buf.write_u64::<BE>(IHAVEOPT).unwrap();
    buf.write_u32::<BE>(option).unwrap();
    buf.write_u32::<BE>(payload.len() as u32).unwrap();
    buf.extend_from_slice(payload);
}

/// Write a raw request header (and payload), bypassing the typed encoder.
fn put_raw_request(buf: &mut Vec<u8>, typ: u16, handle: u64, offset: u64, len: u32, data: &[u8]) {
    buf.write_u32::<BE>(REQUEST_MAGIC).unwrap();
    buf.write_u16::<BE>(0).unwrap();
    buf.write_u16::<BE>(typ).unwrap();
    buf.write_u64::<BE>(handle).unwrap();
    buf.write_u64::<BE>(offset).unwrap();
    buf.write_u32::<BE>(len).unwrap();
    buf.extend_from_slice(data);
}

#[test]
fn test_info_request_golden_bytes() -> Result<()> {
    let mut buf = vec![];
    InfoRequest {
        name: "default".to_string(),
        reqs: vec![InfoType::BLOCK_SIZE.into()],
    }
    .put(OptType::GO, &mut buf)?;

    #[rustfmt::skip]
    let expected: &[u8] = &[
        // IHAVEOPT
        0x49, 0x48, 0x41, 0x56, 0x45, 0x4F, 0x50, 0x54,
        // option 7 (GO), payload length 15
        0x00, 0x00, 0x00, 0x07, 0x00, 0x00, 0x00, 0x0F,
        // name length 7, "default"
        0x00, 0x00, 0x00, 0x07, b'd', b'e', b'f', b'a', b'u', b'l', b't',
        // one info request: BLOCK_SIZE
        0x00, 0x01, 0x00, 0x03,
    ];
    assert_eq!(buf, expected);
    Ok(())
}

#[test]
fn test_option_round_trip() -> Result<()> {
    let req = InfoRequest {
        name: "default".to_string(),
        reqs: vec![3, 1, 2],
    };
    let mut buf = vec![];
    req.put(OptType::INFO, &mut buf)?;
    req.put(OptType::GO, &mut buf)?;

    let mut stream = Cursor::new(buf);
    assert_eq!(
        Opt::get(&mut stream)?,
        Opt {
            option: OptType::INFO.into(),
            body: OptBody::Info(req.clone()),
        }
    );
    assert_eq!(
        Opt::get(&mut stream)?,
        Opt {
            option: OptType::GO.into(),
            body: OptBody::Go(req),
        }
    );
    Ok(())
}

#[test]
fn test_empty_name_round_trip() -> Result<()> {
    let req = InfoRequest {
        name: String::new(),
        reqs: vec![],
    };
    let mut buf = vec![];
    req.put(OptType::GO, &mut buf)?;
    let opt = Opt::get(Cursor::new(buf))?;
    assert_eq!(opt.body, OptBody::Go(req));
    Ok(())
}

#[test]
fn test_unsupported_options_refused_and_aligned() -> Result<()> {
    let mut buf = vec![];
    // recognised but unimplemented
    put_raw_opt(&mut buf, OptType::LIST.into(), &[]);
    // recognised, with a payload that must be consumed
    put_raw_opt(&mut buf, OptType::STARTTLS.into(), &[0xab; 17]);
    // not recognised at all
    put_raw_opt(&mut buf, 0x99, &[1, 2, 3, 4]);
    let end = buf.len() as u64;

    let mut stream = Cursor::new(buf);
    for option in [u32::from(OptType::LIST), OptType::STARTTLS.into(), 0x99] {
        let opt = Opt::get(&mut stream)?;
        assert_eq!(opt.option, option);
        assert_eq!(opt.body, OptBody::Refused(OptError::UNSUP));
    }
    assert_eq!(stream.position(), end);
    Ok(())
}

#[test]
fn test_oversized_option_discarded() -> Result<()> {
    let mut buf = vec![];
    put_raw_opt(&mut buf, OptType::INFO.into(), &vec![0u8; 8192]);
    let end = buf.len() as u64;

    let mut stream = Cursor::new(buf);
    let opt = Opt::get(&mut stream)?;
    assert_eq!(opt.body, OptBody::Refused(OptError::TOO_BIG));
    // all 8192 payload bytes were discarded
    assert_eq!(stream.position(), end);
    Ok(())
}

#[test]
fn test_malformed_info_payloads_invalid_and_aligned() -> Result<()> {
    // payload shorter than the fixed fields
    let cases: Vec<Vec<u8>> = vec![
        vec![0, 0, 0, 0, 0],
        // name length overruns the payload
        {
            let mut p = vec![];
            p.write_u32::<BE>(8).unwrap();
            p.extend_from_slice(&[0u8; 6]);
            p
        },
        // odd number of bytes left for the info requests
        {
            let mut p = vec![];
            p.write_u32::<BE>(4).unwrap();
            p.extend_from_slice(b"disk");
            p.write_u16::<BE>(0).unwrap();
            p.push(0);
            p
        },
        // request count disagrees with the payload length
        {
            let mut p = vec![];
            p.write_u32::<BE>(4).unwrap();
            p.extend_from_slice(b"disk");
            p.write_u16::<BE>(5).unwrap();
            p.write_u16::<BE>(3).unwrap();
            p
        },
        // name is not UTF-8
        {
            let mut p = vec![];
            p.write_u32::<BE>(2).unwrap();
            p.extend_from_slice(&[0xff, 0xfe]);
            p.write_u16::<BE>(0).unwrap();
            p
        },
    ];

    for payload in cases {
        let mut buf = vec![];
        put_raw_opt(&mut buf, OptType::GO.into(), &payload);
        let end = buf.len() as u64;
        let mut stream = Cursor::new(buf);
        let opt = Opt::get(&mut stream)?;
        assert_eq!(opt.body, OptBody::Refused(OptError::INVALID));
        // the payload was consumed in full either way
        assert_eq!(stream.position(), end);
    }
    Ok(())
}

#[test]
fn test_bad_option_magic_is_fatal() {
    let mut buf = vec![];
    buf.write_u64::<BE>(0xdeadbeefdeadbeef).unwrap();
    buf.write_u32::<BE>(OptType::GO.into()).unwrap();
    buf.write_u32::<BE>(0).unwrap();
    assert!(Opt::get(Cursor::new(buf)).is_err());
}

#[test]
fn test_ack_reply_golden_bytes() -> Result<()> {
    let mut buf = vec![];
    OptReply::ack(OptType::GO.into()).put(&mut buf)?;
    #[rustfmt::skip]
    let expected: &[u8] = &[
        // reply magic
        0x00, 0x03, 0xE8, 0x89, 0x04, 0x55, 0x65, 0xA9,
        // option GO, code ACK, length 0
        0x00, 0x00, 0x00, 0x07, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00,
    ];
    assert_eq!(buf, expected);
    Ok(())
}

#[test]
fn test_error_reply_golden_bytes() -> Result<()> {
    let mut buf = vec![];
    OptReply::error(OptType::LIST.into(), OptError::UNSUP).put(&mut buf)?;
    #[rustfmt::skip]
    let expected: &[u8] = &[
        0x00, 0x03, 0xE8, 0x89, 0x04, 0x55, 0x65, 0xA9,
        0x00, 0x00, 0x00, 0x03, 0x80, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00,
    ];
    assert_eq!(buf, expected);
    Ok(())
}

#[test]
fn test_export_info_reply_golden_bytes() -> Result<()> {
    let mut buf = vec![];
    OptReply::info(
        OptType::GO.into(),
        &InfoReply::Export {
            size: 524288000,
            flags: 0,
        },
    )?
    .put(&mut buf)?;
    #[rustfmt::skip]
    let expected: &[u8] = &[
        0x00, 0x03, 0xE8, 0x89, 0x04, 0x55, 0x65, 0xA9,
        // option GO, code INFO, length 12
        0x00, 0x00, 0x00, 0x07, 0x00, 0x00, 0x00, 0x03, 0x00, 0x00, 0x00, 0x0C,
        // info type EXPORT, size 524288000, transmission flags 0
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x1F, 0x40, 0x00, 0x00, 0x00, 0x00,
    ];
    assert_eq!(buf, expected);
    Ok(())
}

#[test]
fn test_info_reply_round_trips() -> Result<()> {
    let replies = [
        InfoReply::Export {
            size: 1 << 30,
            flags: 0,
        },
        InfoReply::Name("default".to_string()),
        InfoReply::Description("a block device".to_string()),
        InfoReply::BlockSize {
            min: 4096,
            preferred: 4096,
            max: 4096,
        },
    ];
    for reply in replies {
        let mut buf = vec![];
        OptReply::info(OptType::INFO.into(), &reply)?.put(&mut buf)?;
        let decoded = OptReply::get(Cursor::new(buf))?;
        assert_eq!(decoded.code, u32::from(ReplyType::INFO));
        assert_eq!(InfoReply::parse(&decoded.data)?, reply);
    }
    Ok(())
}

#[test]
fn test_info_reply_validation() {
    // ack replies carry no payload
    let mut buf = vec![];
    OptReply {
        option: OptType::GO.into(),
        code: ReplyType::ACK.into(),
        data: vec![1],
    }
    .put(&mut buf)
    .unwrap();
    assert!(OptReply::get(Cursor::new(buf)).is_err());

    // export info is exactly ten bytes after the info type
    let mut data = vec![];
    data.write_u16::<BE>(InfoType::EXPORT.into()).unwrap();
    data.write_u64::<BE>(1024).unwrap();
    assert!(InfoReply::parse(&data).is_err());

    // block size info is exactly twelve
    let mut data = vec![];
    data.write_u16::<BE>(InfoType::BLOCK_SIZE.into()).unwrap();
    data.write_u32::<BE>(4096).unwrap();
    assert!(InfoReply::parse(&data).is_err());
}

#[test]
fn test_request_golden_bytes() -> Result<()> {
    let mut buf = vec![];
    Request::new(Cmd::READ, 0x42, 0, 16).put(&[], &mut buf)?;
    #[rustfmt::skip]
    let expected: &[u8] = &[
        // request magic
        0x25, 0x60, 0x95, 0x13,
        // flags 0, type READ
        0x00, 0x00, 0x00, 0x00,
        // handle
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x42,
        // offset
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        // length
        0x00, 0x00, 0x00, 0x10,
    ];
    assert_eq!(buf, expected);
    Ok(())
}

#[test]
fn test_request_round_trip() -> Result<()> {
    let mut buf = vec![];
    Request::new(Cmd::FLUSH, 7, 0, 0).put(&[], &mut buf)?;
    Request::new(Cmd::WRITE, 8, 4096, 8).put(b"ABCDEFGH", &mut buf)?;

    let mut stream = Cursor::new(buf);
    match Request::get(&mut stream)? {
        ReqFrame::Valid(req) => {
            assert_eq!(req.typ, Cmd::FLUSH);
            assert_eq!(req.handle, 7);
            assert_eq!(req.data, b"");
        }
        frame => panic!("unexpected frame {frame:?}"),
    }
    match Request::get(&mut stream)? {
        ReqFrame::Valid(req) => {
            assert_eq!(req.typ, Cmd::WRITE);
            assert_eq!(req.handle, 8);
            assert_eq!(req.offset, 4096);
            assert_eq!(req.len, 8);
            assert_eq!(req.data, b"ABCDEFGH");
        }
        frame => panic!("unexpected frame {frame:?}"),
    }
    Ok(())
}

#[test]
fn test_request_offset_top_bit() -> Result<()> {
    let mut buf = vec![];
    put_raw_request(&mut buf, Cmd::READ.into(), 0xdead, 1 << 63, 16, &[]);
    let header_len = buf.len() as u64;

    let mut stream = Cursor::new(buf);
    match Request::get(&mut stream)? {
        ReqFrame::Malformed { handle, errno } => {
            assert_eq!(handle, 0xdead);
            assert_eq!(errno, ErrorType::EOVERFLOW);
        }
        frame => panic!("unexpected frame {frame:?}"),
    }
    // nothing past the header was consumed
    assert_eq!(stream.position(), header_len);
    Ok(())
}

#[test]
fn test_oversized_write_discarded() -> Result<()> {
    let payload = vec![0xaa; 5 << 20];
    let mut buf = vec![];
    put_raw_request(
        &mut buf,
        Cmd::WRITE.into(),
        7,
        0,
        payload.len() as u32,
        &payload,
    );
    // a well-formed request right after the oversized one
    Request::new(Cmd::READ, 9, 0, 8).put(&[], &mut buf)?;

    let mut stream = Cursor::new(buf);
    match Request::get(&mut stream)? {
        ReqFrame::Malformed { handle, errno } => {
            assert_eq!(handle, 7);
            assert_eq!(errno, ErrorType::EOVERFLOW);
        }
        frame => panic!("unexpected frame {frame:?}"),
    }
    match Request::get(&mut stream)? {
        ReqFrame::Valid(req) => {
            assert_eq!(req.typ, Cmd::READ);
            assert_eq!(req.handle, 9);
        }
        frame => panic!("unexpected frame {frame:?}"),
    }
    Ok(())
}

#[test]
fn test_unknown_command_number() -> Result<()> {
    let mut buf = vec![];
    put_raw_request(&mut buf, 42, 0x77, 0, 0, &[]);
    match Request::get(Cursor::new(buf))? {
        ReqFrame::Malformed { handle, errno } => {
            assert_eq!(handle, 0x77);
            assert_eq!(errno, ErrorType::EINVAL);
        }
        frame => panic!("unexpected frame {frame:?}"),
    }
    Ok(())
}

#[test]
fn test_bad_request_magic_is_fatal() {
    let mut buf = vec![];
    buf.write_u32::<BE>(0xbadc0de).unwrap();
    buf.extend_from_slice(&[0u8; 24]);
    assert!(Request::get(Cursor::new(buf)).is_err());
}

#[test]
fn test_simple_reply_golden_bytes() -> Result<()> {
    let mut buf = vec![];
    SimpleReply::err_handle(ErrorType::EOVERFLOW, 7).put(&mut buf)?;
    #[rustfmt::skip]
    let expected: &[u8] = &[
        // simple reply magic
        0x67, 0x44, 0x66, 0x98,
        // errno 75 (EOVERFLOW)
        0x00, 0x00, 0x00, 0x4B,
        // handle
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x07,
    ];
    assert_eq!(buf, expected);
    Ok(())
}

#[test]
fn test_simple_reply_round_trip() -> Result<()> {
    let req = Request::new(Cmd::READ, 0x42, 0, 4);
    let mut buf = vec![];
    SimpleReply::data(&req, vec![1, 2, 3, 4]).put(&mut buf)?;
    let reply = SimpleReply::get(Cursor::new(buf), 4)?;
    assert_eq!(reply.err, ErrorType::OK);
    assert_eq!(reply.handle, 0x42);
    assert_eq!(reply.data, vec![1, 2, 3, 4]);

    let mut buf = vec![];
    SimpleReply::err(ErrorType::EINVAL, &req).put(&mut buf)?;
    let reply = SimpleReply::get(Cursor::new(buf), 4)?;
    assert_eq!(reply.err, ErrorType::EINVAL);
    assert_eq!(reply.data, b"");
    Ok(())
}
