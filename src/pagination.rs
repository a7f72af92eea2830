use serde::{Deserialize, Serialize};

pub const DEFAULT_PER_PAGE: i64 = 20;
pub const MAX_PER_PAGE: i64 = 100;

/// `?page=2&per_page=20`, 1-based.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct PageQuery {
    pub page: Option<i64>,
    pub per_page: Option<i64>,
}

impl PageQuery {
    pub fn page(&self) -> i64 {
        self.page.unwrap_or(1).max(1)
    }

    pub fn per_page(&self) -> i64 {
        self.per_page.unwrap_or(DEFAULT_PER_PAGE).clamp(1, MAX_PER_PAGE)
    }

    pub fn limit(&self) -> i64 {
        self.per_page()
    }

    pub fn offset(&self) -> i64 {
        (self.page() - 1).saturating_mul(self.per_page())
    }
}

#[derive(Debug, Serialize)]
pub struct Paged<T> {
    pub items: Vec<T>,
    pub page: i64,
    pub per_page: i64,
    pub total: i64,
    pub total_pages: i64,
}

impl<T> Paged<T> {
    pub fn new(items: Vec<T>, q: &PageQuery, total: i64) -> Self {
        let per_page = q.per_page();
        Paged {
            items,
            page: q.page(),
            per_page,
            total,
            total_pages: total_pages(total, per_page),
        }
    }
}

pub fn total_pages(total: i64, per_page: i64) -> i64 {
    if total <= 0 || per_page <= 0 {
        return 0;
    }
    (total + per_page - 1) / per_page
}

#[cfg(test)]
mod tests {
    use super::*;

    fn q(page: Option<i64>, per_page: Option<i64>) -> PageQuery {
        PageQuery { page, per_page }
    }

    #[test]
    fn defaults_to_first_page() {
        let p = q(None, None);
        assert_eq!(p.page(), 1);
        assert_eq!(p.per_page(), DEFAULT_PER_PAGE);
        assert_eq!(p.offset(), 0);
    }

    #[test]
    fn clamps_out_of_range_input() {
        assert_eq!(q(Some(0), None).page(), 1);
        assert_eq!(q(Some(-4), None).page(), 1);
        assert_eq!(q(None, Some(0)).per_page(), 1);
        assert_eq!(q(None, Some(10_000)).per_page(), MAX_PER_PAGE);
    }

    #[test]
    fn offset_is_zero_based() {
        assert_eq!(q(Some(3), Some(25)).offset(), 50);
        assert_eq!(q(Some(i64::MAX), Some(100)).offset(), i64::MAX);
    }

    #[test]
    fn total_pages_rounds_up() {
        assert_eq!(total_pages(0, 20), 0);
        assert_eq!(total_pages(1, 20), 1);
        assert_eq!(total_pages(20, 20), 1);
        assert_eq!(total_pages(21, 20), 2);
    }

    #[test]
    fn paged_carries_request_echo() {
        let p: Paged<u8> = Paged::new(vec![1, 2], &q(Some(2), Some(2)), 5);
        assert_eq!(p.page, 2);
        assert_eq!(p.total_pages, 3);
    }
}
