use bytes::{BufMut, BytesMut};
use netcached::core::NetCacheError;
use netcached::core::protocol::framing::{
    self, BLOB_STREAM_SIGNATURE, CHUNK_SENTINEL, MAX_CHUNK_SIZE,
};

#[tokio::test]
async fn test_blob_stream_roundtrip() {
    let payload: Vec<u8> = (0..1_000_000u32).map(|i| (i % 251) as u8).collect();
    let mut wire = Vec::new();
    framing::write_blob(&mut wire, &payload).await.unwrap();

    let mut swap_hint = None;
    let mut reader = &wire[..];
    let decoded = framing::read_blob(&mut reader, payload.len() as u64, &mut swap_hint)
        .await
        .unwrap();
    assert_eq!(&decoded[..], &payload[..]);
    assert_eq!(swap_hint, Some(false));
}

#[tokio::test]
async fn test_fake_blob_is_empty() {
    let mut wire = Vec::new();
    framing::write_fake_blob(&mut wire).await.unwrap();
    assert_eq!(wire.len(), 8);

    let mut swap_hint = None;
    let mut reader = &wire[..];
    let decoded = framing::read_blob(&mut reader, 0, &mut swap_hint).await.unwrap();
    assert!(decoded.is_empty());
}

#[tokio::test]
async fn test_reader_detects_swapped_byte_order() {
    // A foreign-endian sender emits every length word byte-swapped.
    let payload = b"swapped payload";
    let mut wire = BytesMut::new();
    wire.put_u32(BLOB_STREAM_SIGNATURE); // big-endian on the wire
    wire.put_u32(payload.len() as u32);
    wire.put_slice(payload);
    wire.put_u32(CHUNK_SENTINEL); // sentinel is palindromic

    let mut swap_hint = None;
    let mut reader = &wire[..];
    let decoded = framing::read_blob(&mut reader, payload.len() as u64, &mut swap_hint)
        .await
        .unwrap();
    assert_eq!(&decoded[..], payload);
    assert_eq!(swap_hint, Some(true));
}

#[tokio::test]
async fn test_bad_signature_is_a_protocol_error() {
    let mut wire = BytesMut::new();
    wire.put_u32_le(0xDEAD_BEEF);
    wire.put_u32_le(CHUNK_SENTINEL);

    let mut swap_hint = None;
    let mut reader = &wire[..];
    let err = framing::read_blob(&mut reader, 0, &mut swap_hint)
        .await
        .unwrap_err();
    assert!(matches!(err, NetCacheError::Protocol(_)));
}

#[tokio::test]
async fn test_oversized_chunk_is_rejected() {
    let mut wire = BytesMut::new();
    wire.put_u32_le(BLOB_STREAM_SIGNATURE);
    wire.put_u32_le(MAX_CHUNK_SIZE);

    let mut swap_hint = None;
    let mut reader = &wire[..];
    // The chunk claims more than the announced total size.
    let err = framing::read_blob(&mut reader, 16, &mut swap_hint)
        .await
        .unwrap_err();
    assert!(matches!(err, NetCacheError::Protocol(_)));
}

#[tokio::test]
async fn test_byte_order_may_not_change_mid_connection() {
    let payload = b"x";
    let mut first = Vec::new();
    framing::write_blob(&mut first, payload).await.unwrap();

    let mut second = BytesMut::new();
    second.put_u32(BLOB_STREAM_SIGNATURE);
    second.put_u32(1);
    second.put_slice(b"y");
    second.put_u32(CHUNK_SENTINEL);

    let mut swap_hint = None;
    let mut reader = &first[..];
    framing::read_blob(&mut reader, 1, &mut swap_hint).await.unwrap();
    let mut reader = &second[..];
    let err = framing::read_blob(&mut reader, 1, &mut swap_hint)
        .await
        .unwrap_err();
    assert!(matches!(err, NetCacheError::Protocol(_)));
}
