use super::{
    MAX_REBALANCE_CHECK_REFS, OP_BLOCK, OP_PUT_BLOCK, OP_REBALANCE_CHECK, STATUS_ERR, STATUS_OK,
};
use crate::block::{BLOCK_REF_BYTE_SIZE, BlockRef};
use crate::error::{Result, TorusError};
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

pub fn bitset_len(count: usize) -> usize {
    count.div_ceil(8)
}

/// Bit `i` of the output is set when `flags[i]` is true, least significant
/// bit first within each byte.
pub fn encode_bitset(flags: &[bool]) -> Vec<u8> {
    let mut bits = vec![0u8; bitset_len(flags.len())];
    for (i, flag) in flags.iter().enumerate() {
        if *flag {
            bits[i / 8] |= 1 << (i % 8);
        }
    }
    bits
}

pub fn decode_bitset(bits: &[u8], count: usize) -> Result<Vec<bool>> {
    if bits.len() != bitset_len(count) {
        return Err(TorusError::Protocol(format!(
            "bitset for {} refs must be {} bytes, got {}",
            count,
            bitset_len(count),
            bits.len()
        )));
    }

    Ok((0..count)
        .map(|i| bits[i / 8] & (1 << (i % 8)) != 0)
        .collect())
}

pub fn encode_block_request(block_ref: BlockRef) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + BLOCK_REF_BYTE_SIZE);
    buf.put_u8(OP_BLOCK);
    buf.put_slice(&block_ref.to_bytes());
    buf.freeze()
}

pub fn encode_put_block_request(block_ref: BlockRef, data: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + BLOCK_REF_BYTE_SIZE + data.len());
    buf.put_u8(OP_PUT_BLOCK);
    buf.put_slice(&block_ref.to_bytes());
    buf.put_slice(data);
    buf.freeze()
}

pub fn encode_rebalance_check_request(refs: &[BlockRef]) -> Result<Bytes> {
    if refs.len() > MAX_REBALANCE_CHECK_REFS {
        return Err(TorusError::Protocol(format!(
            "rebalance check carries at most {} refs, got {}",
            MAX_REBALANCE_CHECK_REFS,
            refs.len()
        )));
    }

    let mut buf = BytesMut::with_capacity(2 + refs.len() * BLOCK_REF_BYTE_SIZE);
    buf.put_u8(OP_REBALANCE_CHECK);
    buf.put_u8(refs.len() as u8);
    for block_ref in refs {
        buf.put_slice(&block_ref.to_bytes());
    }
    Ok(buf.freeze())
}

pub fn encode_rebalance_check_response(flags: &[bool]) -> Bytes {
    let bits = encode_bitset(flags);
    let mut buf = BytesMut::with_capacity(1 + bits.len());
    buf.put_u8(STATUS_OK);
    buf.put_slice(&bits);
    buf.freeze()
}

pub async fn read_block_ref<R>(reader: &mut R) -> Result<BlockRef>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; BLOCK_REF_BYTE_SIZE];
    reader.read_exact(&mut buf).await?;
    BlockRef::from_bytes(&buf)
}

pub async fn read_block_refs<R>(reader: &mut R, count: usize) -> Result<Vec<BlockRef>>
where
    R: AsyncRead + Unpin,
{
    let mut refs = Vec::with_capacity(count);
    for _ in 0..count {
        refs.push(read_block_ref(reader).await?);
    }
    Ok(refs)
}

pub async fn read_exact_bytes<R>(reader: &mut R, len: usize) -> Result<Bytes>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Bytes::from(buf))
}

/// Reads a status byte; `Ok(false)` for an error status.
pub async fn read_status<R>(reader: &mut R) -> Result<bool>
where
    R: AsyncRead + Unpin,
{
    match reader.read_u8().await? {
        STATUS_OK => Ok(true),
        STATUS_ERR => Ok(false),
        other => Err(TorusError::Protocol(format!(
            "unknown response status {:#04x}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(count: usize) -> Vec<bool> {
        (0..count).map(|i| i % 3 == 0 || i % 7 == 1).collect()
    }

    #[test]
    fn test_bitset_sizes_and_values() {
        for count in [0usize, 1, 255] {
            let flags = pattern(count);
            let bits = encode_bitset(&flags);
            assert_eq!(bits.len(), count.div_ceil(8));
            assert_eq!(decode_bitset(&bits, count).unwrap(), flags);
        }

        assert_eq!(encode_bitset(&[true, false, true]), vec![0b0000_0101]);
        assert!(decode_bitset(&[0, 0], 3).is_err());
    }

    #[tokio::test]
    async fn test_rebalance_check_request_layout() {
        let refs: Vec<BlockRef> = (0..255).map(|i| BlockRef::new(1, 2, i)).collect();
        let encoded = encode_rebalance_check_request(&refs).unwrap();
        assert_eq!(encoded.len(), 2 + 255 * BLOCK_REF_BYTE_SIZE);
        assert_eq!(encoded[0], OP_REBALANCE_CHECK);
        assert_eq!(encoded[1], 255);

        let mut body = &encoded[2..];
        let decoded = read_block_refs(&mut body, 255).await.unwrap();
        assert_eq!(decoded, refs);

        let too_many: Vec<BlockRef> = (0..256).map(|i| BlockRef::new(1, 2, i)).collect();
        assert!(encode_rebalance_check_request(&too_many).is_err());
    }

    #[tokio::test]
    async fn test_rebalance_check_response_roundtrip() {
        for count in [0usize, 1, 255] {
            let flags = pattern(count);
            let encoded = encode_rebalance_check_response(&flags);

            let mut reader = &encoded[..];
            assert!(read_status(&mut reader).await.unwrap());
            let bits = read_exact_bytes(&mut reader, bitset_len(count)).await.unwrap();
            assert_eq!(decode_bitset(&bits, count).unwrap(), flags);
        }
    }

    #[tokio::test]
    async fn test_put_block_request_layout() {
        let block_ref = BlockRef::new(4, 5, 6);
        let encoded = encode_put_block_request(block_ref, &[9u8; 32]);
        assert_eq!(encoded[0], OP_PUT_BLOCK);

        let mut reader = &encoded[1..];
        assert_eq!(read_block_ref(&mut reader).await.unwrap(), block_ref);
        assert_eq!(
            read_exact_bytes(&mut reader, 32).await.unwrap(),
            Bytes::from(vec![9u8; 32])
        );
        assert!(matches!(
            read_status(&mut &[0x07u8][..]).await,
            Err(TorusError::Protocol(_))
        ));
    }
}
