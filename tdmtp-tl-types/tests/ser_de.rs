use tdmtp_tl_types::deserialize::Error;
use tdmtp_tl_types::{enums, functions, types, Cursor, Deserializable, RawVec, Serializable};

// ── Primitives ────────────────────────────────────────────────────────────────

#[test]
fn bool_constructors() {
    assert_eq!(true.to_bytes(), 0x997275b5u32.to_le_bytes());
    assert_eq!(false.to_bytes(), 0xbc799737u32.to_le_bytes());
    assert_eq!(bool::from_bytes(&0x997275b5u32.to_le_bytes()), Ok(true));
    assert_eq!(
        bool::from_bytes(&1u32.to_le_bytes()),
        Err(Error::UnexpectedConstructor { id: 1 })
    );
}

#[test]
fn deserialize_truncated_returns_eof() {
    let result = i32::from_bytes(&[0x01, 0x02]); // only 2 bytes, need 4
    assert_eq!(result, Err(Error::UnexpectedEof));
}

// ── String / bytes ────────────────────────────────────────────────────────────

#[test]
fn short_bytes_header_and_padding() {
    let bytes = b"hello".as_slice().to_bytes();
    assert_eq!(bytes, [5, b'h', b'e', b'l', b'l', b'o', 0, 0]);
}

#[test]
fn long_string_uses_four_byte_header() {
    // >253 bytes triggers the 4-byte length header path
    let s = "x".repeat(300);
    let bytes = s.to_bytes();
    assert_eq!(&bytes[..4], &[0xfe, 0x2c, 0x01, 0x00]);
    assert_eq!(bytes.len() % 4, 0);
    assert_eq!(String::from_bytes(&bytes).unwrap(), s);
}

#[test]
fn dh_prime_sized_bytes() {
    // 256-byte values (dh_prime, g_a) are the common long case
    let v: Vec<u8> = (0u8..=255).collect();
    let bytes = v.to_bytes();
    assert_eq!(bytes.len(), 260);
    assert_eq!(Vec::<u8>::from_bytes(&bytes).unwrap(), v);
}

#[test]
fn invalid_utf8_is_rejected() {
    let bytes = [0xffu8, 0xfe].as_slice().to_bytes();
    assert_eq!(String::from_bytes(&bytes), Err(Error::InvalidUtf8));
}

// ── Vectors ───────────────────────────────────────────────────────────────────

#[test]
fn boxed_vector_checks_constructor() {
    let mut bytes = 0u32.to_bytes();
    bytes.extend(0i32.to_bytes());
    assert_eq!(
        Vec::<i64>::from_bytes(&bytes),
        Err(Error::UnexpectedConstructor { id: 0 })
    );
}

#[test]
fn vector_count_larger_than_input_is_rejected() {
    let mut bytes = tdmtp_tl_types::VECTOR_ID.to_bytes();
    bytes.extend(1_000_000i32.to_bytes());
    assert_eq!(
        Vec::<i64>::from_bytes(&bytes),
        Err(Error::InvalidLength { len: 1_000_000 })
    );
}

#[test]
fn raw_vector_has_no_header() {
    let v = RawVec(vec![7i32, 8]);
    assert_eq!(v.to_bytes().len(), 12);
    assert_eq!(RawVec::<i32>::from_bytes(&v.to_bytes()).unwrap(), v);
}

// ── Schema ────────────────────────────────────────────────────────────────────

#[test]
fn res_pq_from_server_bytes() {
    let res = types::ResPq {
        nonce: [1; 16],
        server_nonce: [2; 16],
        pq: vec![0x17, 0xed, 0x48, 0x94, 0x1a, 0x08, 0xf9, 0x81],
        server_public_key_fingerprints: vec![-4344800451088585951],
    };
    let enums::ResPq::ResPq(parsed) = enums::ResPq::from_bytes(&res.to_bytes()).unwrap();
    assert_eq!(parsed, res);
}

#[test]
fn req_dh_params_field_order() {
    let req = functions::ReqDhParams {
        nonce: [1; 16],
        server_nonce: [2; 16],
        p: vec![0x49, 0x4c, 0x55, 0x3b],
        q: vec![0x53, 0x91, 0x10, 0x73],
        public_key_fingerprint: 0x0102030405060708,
        encrypted_data: vec![0; 256],
    };
    let bytes = req.to_bytes();
    let mut cur = Cursor::from_slice(&bytes);
    assert_eq!(u32::deserialize(&mut cur).unwrap(), 0xd712e4be);
    cur.read_slice(32).unwrap();
    assert_eq!(Vec::<u8>::deserialize(&mut cur).unwrap(), req.p);
    assert_eq!(Vec::<u8>::deserialize(&mut cur).unwrap(), req.q);
    assert_eq!(i64::deserialize(&mut cur).unwrap(), req.public_key_fingerprint);
    assert_eq!(Vec::<u8>::deserialize(&mut cur).unwrap().len(), 256);
    assert_eq!(cur.remaining(), 0);
}

#[test]
fn service_names_for_logging() {
    assert_eq!(tdmtp_tl_types::name_for_id(0x73f1f8dc), Some("msg_container"));
    assert_eq!(tdmtp_tl_types::name_for_id(0x12345678), None);
}
