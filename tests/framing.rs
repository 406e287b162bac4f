use meshlink::meshtastic::framer::{Frame, FrameError, FrameSink, ParserState, MAX_PAYLOAD_SIZE};
use meshlink::meshtastic::{FrameBuilder, FrameParser, MeshError, RobustFrameParser};

#[derive(Default, Debug, PartialEq)]
struct Collect {
    frames: Vec<Vec<u8>>,
    log: Vec<u8>,
    errors: Vec<FrameError>,
}

impl FrameSink for Collect {
    fn on_frame(&mut self, frame: Frame) {
        self.frames.push(frame.payload);
    }
    fn on_log_byte(&mut self, byte: u8) {
        self.log.push(byte);
    }
    fn on_error(&mut self, err: &FrameError) {
        self.errors.push(err.clone());
    }
}

/// Firmware output with text lines between frames of assorted sizes.
fn mixed_stream() -> (Vec<u8>, Vec<Vec<u8>>) {
    let b = FrameBuilder::new();
    let payloads: Vec<Vec<u8>> = vec![
        vec![],
        b"\x08\x01".to_vec(),
        (0..=255u8).collect(),
        vec![0x94; MAX_PAYLOAD_SIZE],
    ];
    let mut stream = b"DEBUG | boot\r\n".to_vec();
    for (i, p) in payloads.iter().enumerate() {
        stream.extend(b.build_frame(p).unwrap());
        stream.extend(format!("INFO | line {i}\n").as_bytes());
    }
    (stream, payloads)
}

fn parse_in_chunks(stream: &[u8], chunk: usize) -> Collect {
    let mut parser = FrameParser::new();
    let mut sink = Collect::default();
    for part in stream.chunks(chunk) {
        parser.feed(part, &mut sink);
    }
    assert_eq!(parser.state(), ParserState::WaitStart1);
    sink
}

#[test]
fn chunk_boundaries_do_not_matter() {
    let (stream, payloads) = mixed_stream();
    let whole = parse_in_chunks(&stream, stream.len());
    assert_eq!(whole.frames, payloads);
    assert_eq!(
        String::from_utf8(whole.log.clone()).unwrap(),
        "DEBUG | boot\r\nINFO | line 0\nINFO | line 1\nINFO | line 2\nINFO | line 3\n"
    );
    for chunk in [1, 2, 3, 5, 64, 513] {
        assert_eq!(parse_in_chunks(&stream, chunk), whole, "chunk size {chunk}");
    }
}

#[test]
fn counters_follow_the_stream() {
    let (stream, payloads) = mixed_stream();
    let mut parser = FrameParser::new();
    let mut sink = Collect::default();
    parser.feed(&stream, &mut sink);
    assert_eq!(parser.bytes_processed(), stream.len() as u64);
    assert_eq!(parser.frames_processed(), payloads.len() as u64);
}

#[test]
fn truncated_frame_then_new_header_is_absorbed() {
    // A header promising 10 bytes swallows the next header as payload; the parser
    // only resynchronises once that payload is complete.
    let b = FrameBuilder::new();
    let mut stream = vec![0x94, 0xC3, 0x00, 0x0A, 1, 2, 3];
    stream.extend(b.build_frame(&[9, 9, 9]).unwrap());
    stream.extend(b.build_frame(&[7]).unwrap());
    let sink = parse_in_chunks(&stream, 4);
    assert_eq!(sink.frames.len(), 2);
    assert_eq!(sink.frames[0], vec![1, 2, 3, 0x94, 0xC3, 0x00, 0x03, 9, 9, 9]);
    assert_eq!(sink.frames[1], vec![7]);
}

#[test]
fn robust_parser_recovers_from_noise() {
    let b = FrameBuilder::new();
    let mut stream = Vec::new();
    stream.extend([0x94, 0xC3, 0x7F, 0x00]); // bad length
    stream.extend(b"garbage\n");
    stream.extend([0x94, 0x00]); // broken start
    stream.extend(b.build_frame(b"ok").unwrap());

    let mut parser = RobustFrameParser::new();
    let mut sink = Collect::default();
    for part in stream.chunks(3) {
        parser.feed(part, &mut sink).unwrap();
    }
    assert_eq!(sink.frames, vec![b"ok".to_vec()]);
    assert_eq!(sink.errors, vec![FrameError::InvalidLength(0x7F00)]);
    assert_eq!(&sink.log[..8], b"garbage\n");
    assert_eq!(parser.consecutive_errors(), 0);
    assert_eq!(parser.stats().parse_errors, 1);
}

#[test]
fn robust_parser_gives_up_on_garbage_headers() {
    let mut parser = RobustFrameParser::new();
    let mut sink = Collect::default();
    let mut result = Ok(());
    for _ in 0..20 {
        result = parser.feed(&[0x94, 0xC3, 0xFF, 0xFF], &mut sink);
        if result.is_err() {
            break;
        }
    }
    assert!(matches!(result, Err(MeshError::TooManyParseErrors(10))));
    assert_eq!(sink.errors.len(), 10);
}
