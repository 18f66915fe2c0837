use pnacl_bitcode::bits::BitWriter;
use pnacl_bitcode::compress::{compress, CompressFlags};
use pnacl_bitcode::header::{Header, HeaderField, TAG_PNACL_VERSION};
use pnacl_bitcode::records::{
    read_record_list, Record, RecordList, DEFINE_ABBREV_CODE,
};
use pnacl_bitcode::text::{parse_text_records, write_text_records};
use pnacl_bitcode::write::{write_records, WriteFlags};

fn encode_header(header: &Header) -> Vec<u8> {
    let mut w = BitWriter::new();
    header.write_to(&mut w).unwrap();
    w.into_bytes()
}

#[test]
fn header_round_trips_through_its_wire_form() {
    let header = Header::standard();
    let bytes = encode_header(&header);
    assert_eq!(
        bytes,
        [
            0x50, 0x45, 0x58, 0x45, 0x01, 0x00, 0x08, 0x00, 0x11, 0x00, 0x04, 0x00, 0x02, 0x00,
            0x00, 0x00,
        ]
    );
    let (parsed, consumed) = Header::read_from(&mut bytes.as_slice()).unwrap();
    assert_eq!(header, parsed);
    assert_eq!(16, consumed);
    assert!(parsed.is_supported());
}

fn sample_records() -> RecordList {
    vec![
        Record::enter_block(0, 2),
        Record::unabbreviated(1, vec![8]),
        // [Literal(4), VBR(6)]
        Record::new(2, DEFINE_ABBREV_CODE, vec![2, 1, 4, 0, 2, 6]),
        Record::exit_block(),
        Record::enter_block(8, 3),
        Record::new(4, 4, vec![42]),
        Record::unabbreviated(5, vec![1, 2, 3]),
        Record::enter_block(9, 2),
        Record::unabbreviated(6, vec![]),
        Record::exit_block(),
        Record::exit_block(),
    ]
}

#[test]
fn binary_record_lists_round_trip() {
    let records = sample_records();
    let (bytes, results) = write_records(&records, true, WriteFlags::default());
    assert_eq!(0, results.num_errors);
    assert_eq!(0, bytes.len() % 4);
    assert_eq!(records, read_record_list(&bytes).unwrap());
}

#[test]
fn local_abbreviations_round_trip() {
    let records = vec![
        Record::enter_block(11, 3),
        // [Fixed(3), Array, Char6]
        Record::new(2, DEFINE_ABBREV_CODE, vec![3, 0, 1, 3, 0, 3, 0, 4]),
        Record::new(
            4,
            2,
            vec![u64::from(b'h'), u64::from(b'i'), u64::from(b'_'), u64::from(b'0')],
        ),
        Record::exit_block(),
    ];
    let (bytes, results) = write_records(&records, true, WriteFlags::default());
    assert_eq!(0, results.num_errors);
    assert_eq!(records, read_record_list(&bytes).unwrap());
}

#[test]
fn unsupported_but_readable_headers_still_parse() {
    let header = Header::new(vec![
        HeaderField::uint32(TAG_PNACL_VERSION, 2),
        HeaderField::buffer(9, vec![0xaa; 2]),
    ]);
    assert!(header.is_readable());
    assert!(!header.is_supported());

    let records = vec![
        Record::enter_block(8, 2),
        Record::unabbreviated(1, vec![0]),
        Record::exit_block(),
    ];
    let mut w = BitWriter::new();
    header.write_to(&mut w).unwrap();
    let mut bytes = w.into_bytes();
    let (body, results) = write_records(&records, false, WriteFlags::default());
    assert_eq!(0, results.num_errors);
    bytes.extend_from_slice(&body);

    assert_eq!(records, read_record_list(&bytes).unwrap());
}

#[test]
fn minimal_text_round_trip() {
    let text = "1, 0, 0;\n";
    let records = parse_text_records(text).unwrap();
    assert_eq!(records, vec![Record::unabbreviated(1, vec![0, 0])]);
    assert_eq!(text, write_text_records(&records).unwrap());
}

#[test]
fn text_and_binary_agree_on_abbrev_free_streams() {
    let text = "65535, 8, 2;\n1, 2;\n7, 0, 0, 0;\n65534;\n";
    let records = parse_text_records(text).unwrap();
    let (bytes, results) = write_records(&records, true, WriteFlags::default());
    assert_eq!(0, results.num_errors);
    let reread = read_record_list(&bytes).unwrap();
    assert_eq!(records, reread);
    assert_eq!(text, write_text_records(&reread).unwrap());
}

#[test]
fn compressed_streams_decode_to_the_same_payloads() {
    let mut records = vec![Record::enter_block(8, 2)];
    for i in 0..64 {
        records.push(Record::unabbreviated(2, vec![7, i, i * 3]));
    }
    records.push(Record::enter_block(12, 2));
    for _ in 0..16 {
        records.push(Record::unabbreviated(9, vec![1]));
    }
    records.push(Record::exit_block());
    records.push(Record::exit_block());
    let (input, results) = write_records(&records, true, WriteFlags::default());
    assert_eq!(0, results.num_errors);

    let output = compress(&input, CompressFlags::default()).unwrap();
    assert!(output.len() < input.len());
    assert_eq!(0, output.len() % 4);

    // Abbreviation choices aside, the reader must see identical records.
    let data = |bytes: &[u8]| -> Vec<(u64, Vec<u64>)> {
        let mut inside_blockinfo = false;
        let mut out = Vec::new();
        for r in read_record_list(bytes).unwrap() {
            if r.is_enter_block() {
                inside_blockinfo = inside_blockinfo || r.values[0] == 0;
            } else if r.is_exit_block() {
                inside_blockinfo = false;
            } else if !inside_blockinfo && r.code < 65532 {
                out.push((r.code, r.values));
            }
        }
        out
    };
    assert_eq!(data(&input), data(&output));
}
