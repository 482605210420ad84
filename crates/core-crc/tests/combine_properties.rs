use ossx_core_crc::{crc64_combine, Crc64, CrcParams};
use rand::Rng;

fn random_bytes(len: usize) -> Vec<u8> {
    let mut rng = rand::rng();
    (0..len).map(|_| rng.random()).collect()
}

#[test]
fn test_combine_is_associative() {
    let a = random_bytes(333);
    let b = random_bytes(1000);
    let c = random_bytes(17);

    let (ca, cb, cc) = (
        Crc64::checksum(&a),
        Crc64::checksum(&b),
        Crc64::checksum(&c),
    );

    let left = crc64_combine(crc64_combine(ca, cb, b.len() as u64), cc, c.len() as u64);
    let right = crc64_combine(
        ca,
        crc64_combine(cb, cc, c.len() as u64),
        (b.len() + c.len()) as u64,
    );
    assert_eq!(left, right);
}

#[test]
fn test_uneven_parts_combine_to_object_checksum() {
    // 5130 bytes in 500-byte parts leaves a 130-byte tail
    let data = random_bytes(5130);
    let parts: Vec<(u64, u64)> = data
        .chunks(500)
        .map(|p| (Crc64::checksum(p), p.len() as u64))
        .collect();

    assert_eq!(parts.len(), 11);
    assert_eq!(parts[10].1, 130);
    assert_eq!(
        CrcParams::CRC64_XZ.combine_all(parts),
        Crc64::checksum(&data)
    );
}

#[test]
fn test_large_length_is_cheap() {
    let zeros = vec![0u8; 1 << 20];
    let head = Crc64::checksum(b"head");
    let combined = crc64_combine(head, Crc64::checksum(&zeros), zeros.len() as u64);

    let mut hasher = Crc64::new();
    hasher.update(b"head");
    hasher.update(&zeros);
    assert_eq!(combined, hasher.finish());
}
