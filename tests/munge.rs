use pnacl_bitcode::fuzz::{SeededRng, SimpleRecordFuzzer};
use pnacl_bitcode::munge::{EditAction, MungedBitcode};
use pnacl_bitcode::records::{read_record_list, record_list_from_array, Record};
use pnacl_bitcode::write::WriteFlags;

const T: u64 = u64::MAX;

#[test]
fn editing_yields_the_documented_view() {
    let base = vec![
        Record::unabbreviated(0, vec![]),
        Record::unabbreviated(1, vec![7]),
        Record::unabbreviated(2, vec![]),
    ];
    let mut bitcode = MungedBitcode::new(base);
    bitcode.add_after(0, Record::unabbreviated(9, vec![]));
    bitcode.remove(1);
    bitcode.replace(2, Record::unabbreviated(3, vec![1, 2]));

    let edited: Vec<(u64, Vec<u64>)> =
        bitcode.iter().map(|r| (r.code, r.values.clone())).collect();
    assert_eq!(
        edited,
        vec![(0, vec![]), (9, vec![]), (3, vec![1, 2])]
    );
}

#[test]
fn array_form_base_plus_script_writes_valid_bitcode() {
    let base = record_list_from_array(
        &[
            1, 65535, 8, 2, T, //
            3, 1, 10, T, //
            3, 2, 20, 30, T, //
            0, 65534, T,
        ],
        T,
    )
    .unwrap();
    let mut bitcode = MungedBitcode::new(base);
    bitcode
        .munge(
            &[
                1, EditAction::Replace as u64, 3, 5, 50, T, //
                2, EditAction::AddBefore as u64, 3, 4, T,
            ],
            T,
        )
        .unwrap();

    let flags = WriteFlags::default();
    let (bytes, results) = bitcode.write(true, flags);
    assert!(results.succeeded(&flags));
    assert_eq!(
        read_record_list(&bytes).unwrap(),
        vec![
            Record::enter_block(8, 2),
            Record::unabbreviated(5, vec![50]),
            Record::unabbreviated(4, vec![]),
            Record::unabbreviated(2, vec![20, 30]),
            Record::exit_block(),
        ]
    );
}

#[test]
fn recovery_repairs_out_of_range_code_width() {
    let base = vec![
        Record::enter_block(8, 40),
        Record::unabbreviated(1, vec![0]),
        Record::exit_block(),
    ];
    let bitcode = MungedBitcode::new(base);

    let flags = WriteFlags::recovering();
    let (bytes, results) = bitcode.write(true, flags);
    assert_eq!(1, results.num_errors);
    assert_eq!(1, results.num_repairs);
    assert!(results.succeeded(&flags));

    // The repaired stream reads back without error, clamped to 32 bits.
    let records = read_record_list(&bytes).unwrap();
    assert_eq!(Record::enter_block(8, 32), records[0]);
}

fn fuzz_once(seed: &str, salt: u64) -> Vec<u8> {
    let base = vec![
        Record::enter_block(8, 2),
        Record::unabbreviated(1, vec![4]),
        Record::unabbreviated(2, vec![5, 6]),
        Record::unabbreviated(3, vec![]),
        Record::exit_block(),
    ];
    let mut bitcode = MungedBitcode::new(base);
    let mut rng = SeededRng::new(seed);
    let mut fuzzer = SimpleRecordFuzzer::new(&mut bitcode, &mut rng).unwrap();
    fuzzer.generator().salt_seed(salt);
    fuzzer.fuzz(100, 100);
    let (bytes, _) = bitcode.write(true, WriteFlags::recovering());
    bytes
}

#[test]
fn fuzzing_is_deterministic_per_seed_and_salt() {
    assert_eq!(fuzz_once("abc", 0), fuzz_once("abc", 0));
    assert_eq!(fuzz_once("abc", 1), fuzz_once("abc", 1));
    assert_eq!(fuzz_once("xyz", 7), fuzz_once("xyz", 7));
}

#[test]
fn fuzzed_streams_always_write_word_aligned() {
    for salt in 0..32 {
        let bytes = fuzz_once("alignment", salt);
        assert_eq!(0, bytes.len() % 4, "salt {salt}");
    }
}

#[test]
fn write_then_reread_base_records_without_edits() {
    let base = vec![
        Record::enter_block(8, 2),
        Record::unabbreviated(1, vec![2]),
        Record::exit_block(),
    ];
    let bitcode = MungedBitcode::new(base.clone());
    let (bytes, results) = bitcode.write(true, WriteFlags::default());
    assert_eq!(0, results.num_errors);
    let reread = read_record_list(&bytes).unwrap();
    assert_eq!(base, reread);

    // A second munged bitcode can share the same base cheaply.
    let shared = bitcode.shared_base();
    let other = MungedBitcode::from_shared(shared);
    assert_eq!(&base, other.base_records());
}
