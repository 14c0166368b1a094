use crate::error::{VellumError, VellumResult};
use crate::storage::codec::DecodedData;

pub struct CommonCodec;

impl CommonCodec {
    pub fn encode_u8(data: u8) -> Vec<u8> {
        data.to_be_bytes().to_vec()
    }

    pub fn decode_u8(bytes: &[u8]) -> VellumResult<DecodedData<u8>> {
        if bytes.is_empty() {
            return Err(VellumError::Internal(
                "bytes exhausted while decoding u8".to_string(),
            ));
        }
        Ok((bytes[0], 1))
    }

    pub fn encode_u32(data: u32) -> Vec<u8> {
        data.to_be_bytes().to_vec()
    }

    pub fn decode_u32(bytes: &[u8]) -> VellumResult<DecodedData<u32>> {
        if bytes.len() < 4 {
            return Err(VellumError::Internal(format!(
                "bytes length {} is less than 4",
                bytes.len()
            )));
        }
        let data = [bytes[0], bytes[1], bytes[2], bytes[3]];
        Ok((u32::from_be_bytes(data), 4))
    }

    pub fn encode_i64(data: i64) -> Vec<u8> {
        data.to_be_bytes().to_vec()
    }

    pub fn decode_i64(bytes: &[u8]) -> VellumResult<DecodedData<i64>> {
        if bytes.len() < 8 {
            return Err(VellumError::Internal(format!(
                "bytes length {} is less than 8",
                bytes.len()
            )));
        }
        let data = [
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
        ];
        Ok((i64::from_be_bytes(data), 8))
    }

    /// Length-prefixed byte string.
    pub fn encode_bytes(data: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(4 + data.len());
        bytes.extend(Self::encode_u32(data.len() as u32));
        bytes.extend_from_slice(data);
        bytes
    }

    pub fn decode_bytes(bytes: &[u8]) -> VellumResult<DecodedData<Vec<u8>>> {
        let (length, offset) = Self::decode_u32(bytes)?;
        let length = length as usize;
        if bytes.len() < offset + length {
            return Err(VellumError::Internal(format!(
                "bytes length {} is less than expected {}",
                bytes.len(),
                offset + length
            )));
        }
        Ok((bytes[offset..offset + length].to_vec(), offset + length))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_round_trips() {
        assert_eq!(CommonCodec::decode_u8(&CommonCodec::encode_u8(5)).unwrap().0, 5);
        assert_eq!(
            CommonCodec::decode_u32(&CommonCodec::encode_u32(123_456)).unwrap().0,
            123_456
        );
        assert_eq!(
            CommonCodec::decode_i64(&CommonCodec::encode_i64(-42)).unwrap().0,
            -42
        );
    }

    #[test]
    fn bytes_round_trip() {
        let data = vec![9, 0, 7, 0, 0, 1];
        let encoded = CommonCodec::encode_bytes(&data);
        let (decoded, consumed) = CommonCodec::decode_bytes(&encoded).unwrap();
        assert_eq!(decoded, data);
        assert_eq!(consumed, encoded.len());
    }

    #[test]
    fn truncated_input_errors() {
        assert!(CommonCodec::decode_u32(&[1, 2]).is_err());
        let mut encoded = CommonCodec::encode_bytes(b"hello");
        encoded.truncate(6);
        assert!(CommonCodec::decode_bytes(&encoded).is_err());
    }
}
