use crate::buffer::{PageId, PAGE_SIZE};
use crate::error::{VellumError, VellumResult};
use crate::index::comparator::KeyComparator;
use crate::storage::codec::{CommonCodec, DecodedData};
use crate::storage::page::{
    BPlusTreeInternalPage, BPlusTreeInternalPageHeader, BPlusTreeLeafPage,
    BPlusTreeLeafPageHeader, BPlusTreePage, BPlusTreePageType, RecordId,
};

pub struct BPlusTreePageCodec;

impl BPlusTreePageCodec {
    pub fn encode(page: &BPlusTreePage) -> Vec<u8> {
        match page {
            BPlusTreePage::Leaf(page) => BPlusTreeLeafPageCodec::encode(page),
            BPlusTreePage::Internal(page) => BPlusTreeInternalPageCodec::encode(page),
        }
    }

    pub fn decode(bytes: &[u8], comparator: KeyComparator) -> VellumResult<DecodedData<BPlusTreePage>> {
        let (page_type, _) = BPlusTreePageTypeCodec::decode(bytes)?;
        match page_type {
            BPlusTreePageType::LeafPage => {
                let (page, offset) = BPlusTreeLeafPageCodec::decode(bytes, comparator)?;
                Ok((BPlusTreePage::Leaf(page), offset))
            }
            BPlusTreePageType::InternalPage => {
                let (page, offset) = BPlusTreeInternalPageCodec::decode(bytes, comparator)?;
                Ok((BPlusTreePage::Internal(page), offset))
            }
        }
    }

    /// Reads only the node kind and occupancy, for crabbing safety checks.
    pub fn decode_size_info(bytes: &[u8]) -> VellumResult<(BPlusTreePageType, u32, u32)> {
        let mut left_bytes = bytes;
        let (page_type, offset) = BPlusTreePageTypeCodec::decode(left_bytes)?;
        left_bytes = &left_bytes[offset..];
        let (current_size, offset) = CommonCodec::decode_u32(left_bytes)?;
        left_bytes = &left_bytes[offset..];
        let (max_size, _) = CommonCodec::decode_u32(left_bytes)?;
        Ok((page_type, current_size, max_size))
    }
}

pub struct BPlusTreePageTypeCodec;

impl BPlusTreePageTypeCodec {
    pub fn encode(page_type: &BPlusTreePageType) -> Vec<u8> {
        match page_type {
            BPlusTreePageType::LeafPage => CommonCodec::encode_u8(1),
            BPlusTreePageType::InternalPage => CommonCodec::encode_u8(2),
        }
    }

    pub fn decode(bytes: &[u8]) -> VellumResult<DecodedData<BPlusTreePageType>> {
        let (flag, offset) = CommonCodec::decode_u8(bytes)?;
        match flag {
            1 => Ok((BPlusTreePageType::LeafPage, offset)),
            2 => Ok((BPlusTreePageType::InternalPage, offset)),
            _ => Err(VellumError::Internal(format!(
                "invalid index page type {}",
                flag
            ))),
        }
    }
}

pub struct BPlusTreeLeafPageCodec;

impl BPlusTreeLeafPageCodec {
    pub fn encode(page: &BPlusTreeLeafPage) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(PAGE_SIZE);
        bytes.extend(BPlusTreeLeafPageHeaderCodec::encode(&page.header));
        for (key, rid) in page.array.iter() {
            bytes.extend(CommonCodec::encode_bytes(key));
            bytes.extend(RecordIdCodec::encode(rid));
        }
        assert!(bytes.len() <= PAGE_SIZE, "leaf page overflows page size");
        bytes.resize(PAGE_SIZE, 0);
        bytes
    }

    pub fn decode(
        bytes: &[u8],
        comparator: KeyComparator,
    ) -> VellumResult<DecodedData<BPlusTreeLeafPage>> {
        if bytes.len() != PAGE_SIZE {
            return Err(VellumError::Internal(format!(
                "index page size is {} instead of {}",
                bytes.len(),
                PAGE_SIZE
            )));
        }
        let mut left_bytes = bytes;
        let (header, offset) = BPlusTreeLeafPageHeaderCodec::decode(left_bytes)?;
        left_bytes = &left_bytes[offset..];

        let mut array = Vec::with_capacity(header.current_size as usize);
        for _ in 0..header.current_size {
            let (key, offset) = CommonCodec::decode_bytes(left_bytes)?;
            left_bytes = &left_bytes[offset..];
            let (rid, offset) = RecordIdCodec::decode(left_bytes)?;
            left_bytes = &left_bytes[offset..];
            array.push((key, rid));
        }

        Ok((
            BPlusTreeLeafPage {
                header,
                array,
                comparator,
            },
            PAGE_SIZE,
        ))
    }
}

pub struct BPlusTreeLeafPageHeaderCodec;

impl BPlusTreeLeafPageHeaderCodec {
    pub fn encode(header: &BPlusTreeLeafPageHeader) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend(BPlusTreePageTypeCodec::encode(&header.page_type));
        bytes.extend(CommonCodec::encode_u32(header.current_size));
        bytes.extend(CommonCodec::encode_u32(header.max_size));
        bytes.extend(CommonCodec::encode_u32(header.parent_page_id));
        bytes.extend(CommonCodec::encode_u32(header.page_id));
        bytes.extend(CommonCodec::encode_u32(header.next_page_id));
        bytes
    }

    pub fn decode(bytes: &[u8]) -> VellumResult<DecodedData<BPlusTreeLeafPageHeader>> {
        let mut left_bytes = bytes;
        let (page_type, offset) = BPlusTreePageTypeCodec::decode(left_bytes)?;
        if page_type != BPlusTreePageType::LeafPage {
            return Err(VellumError::Internal(
                "index page type must be leaf".to_string(),
            ));
        }
        left_bytes = &left_bytes[offset..];
        let (current_size, offset) = CommonCodec::decode_u32(left_bytes)?;
        left_bytes = &left_bytes[offset..];
        let (max_size, offset) = CommonCodec::decode_u32(left_bytes)?;
        left_bytes = &left_bytes[offset..];
        let (parent_page_id, offset) = CommonCodec::decode_u32(left_bytes)?;
        left_bytes = &left_bytes[offset..];
        let (page_id, offset) = CommonCodec::decode_u32(left_bytes)?;
        left_bytes = &left_bytes[offset..];
        let (next_page_id, offset) = CommonCodec::decode_u32(left_bytes)?;
        left_bytes = &left_bytes[offset..];

        Ok((
            BPlusTreeLeafPageHeader {
                page_type,
                current_size,
                max_size,
                parent_page_id,
                page_id,
                next_page_id,
            },
            bytes.len() - left_bytes.len(),
        ))
    }
}

pub struct BPlusTreeInternalPageCodec;

impl BPlusTreeInternalPageCodec {
    pub fn encode(page: &BPlusTreeInternalPage) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(PAGE_SIZE);
        bytes.extend(BPlusTreeInternalPageHeaderCodec::encode(&page.header));
        for (key, child) in page.array.iter() {
            bytes.extend(CommonCodec::encode_bytes(key));
            bytes.extend(CommonCodec::encode_u32(*child));
        }
        assert!(bytes.len() <= PAGE_SIZE, "internal page overflows page size");
        bytes.resize(PAGE_SIZE, 0);
        bytes
    }

    pub fn decode(
        bytes: &[u8],
        comparator: KeyComparator,
    ) -> VellumResult<DecodedData<BPlusTreeInternalPage>> {
        if bytes.len() != PAGE_SIZE {
            return Err(VellumError::Internal(format!(
                "index page size is {} instead of {}",
                bytes.len(),
                PAGE_SIZE
            )));
        }
        let mut left_bytes = bytes;
        let (header, offset) = BPlusTreeInternalPageHeaderCodec::decode(left_bytes)?;
        left_bytes = &left_bytes[offset..];

        let mut array = Vec::with_capacity(header.current_size as usize);
        for _ in 0..header.current_size {
            let (key, offset) = CommonCodec::decode_bytes(left_bytes)?;
            left_bytes = &left_bytes[offset..];
            let (child, offset) = CommonCodec::decode_u32(left_bytes)?;
            left_bytes = &left_bytes[offset..];
            array.push((key, child));
        }

        Ok((
            BPlusTreeInternalPage {
                header,
                array,
                comparator,
            },
            PAGE_SIZE,
        ))
    }
}

pub struct BPlusTreeInternalPageHeaderCodec;

impl BPlusTreeInternalPageHeaderCodec {
    pub fn encode(header: &BPlusTreeInternalPageHeader) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend(BPlusTreePageTypeCodec::encode(&header.page_type));
        bytes.extend(CommonCodec::encode_u32(header.current_size));
        bytes.extend(CommonCodec::encode_u32(header.max_size));
        bytes.extend(CommonCodec::encode_u32(header.parent_page_id));
        bytes.extend(CommonCodec::encode_u32(header.page_id));
        bytes
    }

    pub fn decode(bytes: &[u8]) -> VellumResult<DecodedData<BPlusTreeInternalPageHeader>> {
        let mut left_bytes = bytes;
        let (page_type, offset) = BPlusTreePageTypeCodec::decode(left_bytes)?;
        if page_type != BPlusTreePageType::InternalPage {
            return Err(VellumError::Internal(
                "index page type must be internal".to_string(),
            ));
        }
        left_bytes = &left_bytes[offset..];
        let (current_size, offset) = CommonCodec::decode_u32(left_bytes)?;
        left_bytes = &left_bytes[offset..];
        let (max_size, offset) = CommonCodec::decode_u32(left_bytes)?;
        left_bytes = &left_bytes[offset..];
        let (parent_page_id, offset) = CommonCodec::decode_u32(left_bytes)?;
        left_bytes = &left_bytes[offset..];
        let (page_id, offset) = CommonCodec::decode_u32(left_bytes)?;
        left_bytes = &left_bytes[offset..];

        Ok((
            BPlusTreeInternalPageHeader {
                page_type,
                current_size,
                max_size,
                parent_page_id,
                page_id,
            },
            bytes.len() - left_bytes.len(),
        ))
    }
}

pub struct RecordIdCodec;

impl RecordIdCodec {
    pub fn encode(rid: &RecordId) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(8);
        bytes.extend(CommonCodec::encode_u32(rid.page_id));
        bytes.extend(CommonCodec::encode_u32(rid.slot_num));
        bytes
    }

    pub fn decode(bytes: &[u8]) -> VellumResult<DecodedData<RecordId>> {
        let mut left_bytes = bytes;
        let (page_id, offset) = CommonCodec::decode_u32(left_bytes)?;
        left_bytes = &left_bytes[offset..];
        let (slot_num, offset) = CommonCodec::decode_u32(left_bytes)?;
        left_bytes = &left_bytes[offset..];
        Ok((
            RecordId { page_id, slot_num },
            bytes.len() - left_bytes.len(),
        ))
    }
}
