use crate::buffer::PAGE_SIZE;
use crate::error::{VellumError, VellumResult};
use crate::storage::codec::{CommonCodec, DecodedData};
use crate::storage::page::HeaderPage;

pub struct HeaderPageCodec;

impl HeaderPageCodec {
    pub fn encode(page: &HeaderPage) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(PAGE_SIZE);
        bytes.extend(CommonCodec::encode_u32(page.records.len() as u32));
        for (name, root_page_id) in page.records.iter() {
            bytes.extend(CommonCodec::encode_bytes(name.as_bytes()));
            bytes.extend(CommonCodec::encode_u32(*root_page_id));
        }
        assert!(bytes.len() <= PAGE_SIZE, "header page overflows page size");
        bytes.resize(PAGE_SIZE, 0);
        bytes
    }

    pub fn decode(bytes: &[u8]) -> VellumResult<DecodedData<HeaderPage>> {
        let mut left_bytes = bytes;
        let (count, offset) = CommonCodec::decode_u32(left_bytes)?;
        left_bytes = &left_bytes[offset..];

        let mut records = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let (name_bytes, offset) = CommonCodec::decode_bytes(left_bytes)?;
            left_bytes = &left_bytes[offset..];
            let (root_page_id, offset) = CommonCodec::decode_u32(left_bytes)?;
            left_bytes = &left_bytes[offset..];
            let name = String::from_utf8(name_bytes)
                .map_err(|e| VellumError::Internal(format!("invalid index name: {}", e)))?;
            records.push((name, root_page_id));
        }

        Ok((HeaderPage { records }, bytes.len() - left_bytes.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_page_round_trip() {
        let mut page = HeaderPage::new();
        page.insert_record("orders_pk", 12);
        page.insert_record("users_pk", 99);

        let encoded = HeaderPageCodec::encode(&page);
        assert_eq!(encoded.len(), PAGE_SIZE);
        let (decoded, _) = HeaderPageCodec::decode(&encoded).unwrap();
        assert_eq!(decoded, page);
    }

    #[test]
    fn zeroed_page_decodes_as_empty() {
        let zeroes = vec![0u8; PAGE_SIZE];
        let (decoded, _) = HeaderPageCodec::decode(&zeroes).unwrap();
        assert!(decoded.records.is_empty());
    }
}
