use byteorder::{ByteOrder, LittleEndian};

use crate::common::types::{Page, PageId, PAGE_SIZE};

// Page 0 layout:
// - record_count: u32 (4 bytes)
// - records: [{ name: 32 bytes, zero padded; root_page_id: i32 }]
const RECORD_COUNT_OFFSET: usize = 0;
const RECORDS_OFFSET: usize = 4;
const NAME_LEN: usize = 32;
const RECORD_LEN: usize = NAME_LEN + 4;

/// Maximum number of index records page 0 can hold.
pub const MAX_HEADER_RECORDS: usize = (PAGE_SIZE - RECORDS_OFFSET) / RECORD_LEN;

/// Accessors for the header page: a directory of `{index name -> root
/// page id}` records stored on page 0. The B+ tree updates its record
/// every time `root_page_id` changes.
///
/// Callers fetch page 0 through the buffer pool and unpin it dirty
/// after a mutation; these functions only touch the byte buffer.
pub struct HeaderPage;

impl HeaderPage {
    /// Add a `{name -> root_page_id}` record. Fails if the name is
    /// already present, too long, or the page is full.
    pub fn insert_record(page: &mut Page, name: &str, root_page_id: PageId) -> bool {
        if name.len() > NAME_LEN || Self::find_record(page, name).is_some() {
            return false;
        }
        let count = Self::record_count(page);
        if count >= MAX_HEADER_RECORDS {
            return false;
        }

        let offset = RECORDS_OFFSET + count * RECORD_LEN;
        page.data[offset..offset + NAME_LEN].fill(0);
        page.data[offset..offset + name.len()].copy_from_slice(name.as_bytes());
        LittleEndian::write_i32(&mut page.data[offset + NAME_LEN..offset + RECORD_LEN], root_page_id);
        Self::set_record_count(page, count + 1);
        true
    }

    /// Overwrite the root page id of an existing record.
    pub fn update_record(page: &mut Page, name: &str, root_page_id: PageId) -> bool {
        match Self::find_record(page, name) {
            Some(index) => {
                let offset = RECORDS_OFFSET + index * RECORD_LEN;
                LittleEndian::write_i32(&mut page.data[offset + NAME_LEN..offset + RECORD_LEN], root_page_id);
                true
            }
            None => false,
        }
    }

    /// Remove a record, compacting the array behind it.
    pub fn delete_record(page: &mut Page, name: &str) -> bool {
        let Some(index) = Self::find_record(page, name) else {
            return false;
        };
        let count = Self::record_count(page);
        let start = RECORDS_OFFSET + index * RECORD_LEN;
        let end = RECORDS_OFFSET + count * RECORD_LEN;
        page.data.copy_within(start + RECORD_LEN..end, start);
        page.data[end - RECORD_LEN..end].fill(0);
        Self::set_record_count(page, count - 1);
        true
    }

    /// Look up the root page id registered under `name`.
    pub fn get_root_id(page: &Page, name: &str) -> Option<PageId> {
        Self::find_record(page, name).map(|index| {
            let offset = RECORDS_OFFSET + index * RECORD_LEN;
            LittleEndian::read_i32(&page.data[offset + NAME_LEN..offset + RECORD_LEN])
        })
    }

    pub fn record_count(page: &Page) -> usize {
        LittleEndian::read_u32(&page.data[RECORD_COUNT_OFFSET..RECORD_COUNT_OFFSET + 4]) as usize
    }

    fn set_record_count(page: &mut Page, count: usize) {
        LittleEndian::write_u32(&mut page.data[RECORD_COUNT_OFFSET..RECORD_COUNT_OFFSET + 4], count as u32);
    }

    fn find_record(page: &Page, name: &str) -> Option<usize> {
        let count = Self::record_count(page);
        (0..count).find(|&index| {
            let offset = RECORDS_OFFSET + index * RECORD_LEN;
            let stored = &page.data[offset..offset + NAME_LEN];
            let stored_name = &stored[..stored.iter().position(|&b| b == 0).unwrap_or(NAME_LEN)];
            stored_name == name.as_bytes()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::HEADER_PAGE_ID;

    #[test]
    fn test_insert_and_get() {
        let mut page = Page::new(HEADER_PAGE_ID);
        assert!(HeaderPage::insert_record(&mut page, "orders_pk", 7));
        assert!(HeaderPage::insert_record(&mut page, "users_pk", 12));

        assert_eq!(HeaderPage::get_root_id(&page, "orders_pk"), Some(7));
        assert_eq!(HeaderPage::get_root_id(&page, "users_pk"), Some(12));
        assert_eq!(HeaderPage::get_root_id(&page, "missing"), None);
    }

    #[test]
    fn test_duplicate_insert_rejected() {
        let mut page = Page::new(HEADER_PAGE_ID);
        assert!(HeaderPage::insert_record(&mut page, "idx", 3));
        assert!(!HeaderPage::insert_record(&mut page, "idx", 4));
        assert_eq!(HeaderPage::get_root_id(&page, "idx"), Some(3));
    }

    #[test]
    fn test_update_record() {
        let mut page = Page::new(HEADER_PAGE_ID);
        assert!(!HeaderPage::update_record(&mut page, "idx", 9));
        assert!(HeaderPage::insert_record(&mut page, "idx", 3));
        assert!(HeaderPage::update_record(&mut page, "idx", 9));
        assert_eq!(HeaderPage::get_root_id(&page, "idx"), Some(9));
    }

    #[test]
    fn test_delete_compacts() {
        let mut page = Page::new(HEADER_PAGE_ID);
        HeaderPage::insert_record(&mut page, "a", 1);
        HeaderPage::insert_record(&mut page, "b", 2);
        HeaderPage::insert_record(&mut page, "c", 3);

        assert!(HeaderPage::delete_record(&mut page, "b"));
        assert_eq!(HeaderPage::record_count(&page), 2);
        assert_eq!(HeaderPage::get_root_id(&page, "a"), Some(1));
        assert_eq!(HeaderPage::get_root_id(&page, "b"), None);
        assert_eq!(HeaderPage::get_root_id(&page, "c"), Some(3));
    }
}
