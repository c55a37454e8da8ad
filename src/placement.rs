//! Which pages a visual element goes on.

use serde::{Deserialize, Serialize};

use crate::appearance::VisualElement;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PagePlacement {
    /// Only on [`VisualElement::page`].
    #[default]
    SinglePage,
    AllPages,
    /// On the pages selected by [`VisualElement::page_range`].
    Range,
}

/// Pages selected by [`PagePlacement::Range`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PageRange {
    /// 1-based page numbers. Empty means every page.
    pub pages: Vec<u32>,
    pub exclude_first: bool,
    pub exclude_first_count: u32,
    pub exclude_last: bool,
    pub exclude_last_count: u32,
}

impl PageRange {
    fn contains(&self, page_index: usize, total_pages: usize) -> bool {
        let page_number = page_index + 1;
        if !self.pages.is_empty() && !self.pages.iter().any(|&p| p as usize == page_number) {
            return false;
        }
        if self.exclude_last
            && page_number > total_pages.saturating_sub(self.exclude_last_count as usize)
        {
            return false;
        }
        if self.exclude_first && page_number <= self.exclude_first_count as usize {
            return false;
        }
        true
    }
}

/// Maps a configured page to a 0-based index. Positive pages are 1-based,
/// negative ones count from the end, `-1` being the last page.
pub fn resolve_page(page: i32, total_pages: usize) -> Option<usize> {
    let index = match page {
        0 => return None,
        p if p > 0 => p as usize - 1,
        p => total_pages.checked_sub(p.unsigned_abs() as usize)?,
    };
    (index < total_pages).then_some(index)
}

/// Whether `element` is drawn on the page at `page_index`.
pub fn should_place(page_index: usize, total_pages: usize, element: &VisualElement) -> bool {
    if page_index >= total_pages {
        return false;
    }
    match element.placement {
        PagePlacement::SinglePage => resolve_page(element.page, total_pages) == Some(page_index),
        PagePlacement::AllPages => true,
        PagePlacement::Range => element
            .page_range
            .as_ref()
            .is_some_and(|range| range.contains(page_index, total_pages)),
    }
}
