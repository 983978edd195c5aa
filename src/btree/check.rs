//! Tree integrity walker and pretty-printer, for tests and debugging.

use std::collections::HashSet;
use std::fmt::Write as _;

use itertools::Itertools;

use crate::error::Result;
use crate::storage::page::{
    self, HeaderPage, InternalNode, LeafNode, PAGE_BODY, SLOT_SIZE,
};
use crate::types::{PageNum, RecordKey, TableId};
use crate::Database;

impl Database {
    /// Walk the whole table and assert every structural invariant: the
    /// free list is acyclic and bounded, keys are sorted inside and
    /// across leaves, children point back at their parents, and leaf
    /// free-space accounting matches the slot directory.
    ///
    /// # Panics
    ///
    /// Panics on the first violation; this is a debugging aid, not an
    /// API.
    pub fn check_tree(&self, table_id: TableId) -> Result<()> {
        let header = HeaderPage::from_page(self.pool.read_page((table_id, 0), 0, false)?);

        self.check_free_list(table_id, &header)?;

        if header.root_page() != 0 {
            self.check_subtree(table_id, header.root_page(), 0, None, None)?;
        }
        Ok(())
    }

    fn check_free_list(&self, table_id: TableId, header: &HeaderPage) -> Result<()> {
        let mut visited = HashSet::new();
        let mut current = header.free_head();
        while current != 0 {
            assert!(
                current < header.page_count(),
                "free page {} beyond page count {}",
                current,
                header.page_count()
            );
            assert!(visited.insert(current), "free list cycles at page {}", current);

            let free = self.pool.read_page((table_id, current), 0, false)?;
            current = page::FreePage::from_page(free).next_free();
        }
        Ok(())
    }

    /// Returns the `(min, max)` key range of the subtree.
    fn check_subtree(
        &self,
        table_id: TableId,
        page_num: PageNum,
        expected_parent: PageNum,
        lower: Option<RecordKey>,
        upper: Option<RecordKey>,
    ) -> Result<(RecordKey, RecordKey)> {
        let raw = self.pool.read_page((table_id, page_num), 0, false)?;

        if page::is_leaf(&raw) {
            let leaf = LeafNode::from_page(raw);
            assert_eq!(
                leaf.parent(),
                expected_parent,
                "leaf {} carries parent {}, reached from {}",
                page_num,
                leaf.parent(),
                expected_parent
            );
            assert!(leaf.key_count() > 0, "empty non-root leaf {}", page_num);

            let keys: Vec<RecordKey> = (0..leaf.key_count()).map(|i| leaf.slot(i).key).collect();
            assert!(
                keys.iter().tuple_windows().all(|(a, b)| a < b),
                "leaf {} keys out of order: {:?}",
                page_num,
                keys
            );
            for &key in &keys {
                assert!(lower.map_or(true, |l| key >= l), "leaf {} underflows its range", page_num);
                assert!(upper.map_or(true, |u| key < u), "leaf {} overflows its range", page_num);
            }

            let used: usize = (0..leaf.key_count())
                .map(|i| leaf.slot(i).value_size as usize + SLOT_SIZE)
                .sum();
            assert_eq!(
                leaf.free_space(),
                PAGE_BODY - used,
                "leaf {} free space out of sync with its slots",
                page_num
            );

            return Ok((keys[0], *keys.last().unwrap()));
        }

        let node = InternalNode::from_page(raw);
        assert_eq!(
            node.parent(),
            expected_parent,
            "internal {} carries parent {}, reached from {}",
            page_num,
            node.parent(),
            expected_parent
        );
        assert!(node.key_count() > 0, "empty internal node {}", page_num);

        let branches = node.branches();
        assert!(
            branches.iter().tuple_windows().all(|(a, b)| a.key < b.key),
            "internal {} branch keys out of order",
            page_num
        );

        let (mut min, _) = self.check_subtree(
            table_id,
            node.leftmost_child(),
            page_num,
            lower,
            Some(branches[0].key),
        )?;

        let mut max = min;
        for (i, branch) in branches.iter().enumerate() {
            let child_upper = branches.get(i + 1).map(|b| b.key).or(upper);
            let (child_min, child_max) = self.check_subtree(
                table_id,
                branch.child,
                page_num,
                Some(branch.key),
                child_upper,
            )?;
            assert!(
                child_min >= branch.key,
                "internal {} branch {} does not partition its child",
                page_num,
                i
            );
            min = min.min(child_min);
            max = max.max(child_max);
        }

        Ok((min, max))
    }

    /// Render the tree as an indented outline. Debugging helper for
    /// tests; typically fed to `debug!`.
    pub fn format_tree(&self, table_id: TableId) -> Result<String> {
        let header = HeaderPage::from_page(self.pool.read_page((table_id, 0), 0, false)?);
        let mut out = String::new();

        if header.root_page() == 0 {
            out.push_str("(empty tree)\n");
            return Ok(out);
        }

        self.format_subtree(table_id, header.root_page(), 0, &mut out)?;
        Ok(out)
    }

    fn format_subtree(
        &self,
        table_id: TableId,
        page_num: PageNum,
        depth: usize,
        out: &mut String,
    ) -> Result<()> {
        let raw = self.pool.read_page((table_id, page_num), 0, false)?;
        let indent = "  ".repeat(depth);

        if page::is_leaf(&raw) {
            let leaf = LeafNode::from_page(raw);
            let keys: Vec<RecordKey> = (0..leaf.key_count()).map(|i| leaf.slot(i).key).collect();
            writeln!(
                out,
                "{}leaf {} -> {} [{} records, {} free] {:?}",
                indent,
                page_num,
                leaf.next_sibling(),
                leaf.key_count(),
                leaf.free_space(),
                keys
            )
            .unwrap();
            return Ok(());
        }

        let node = InternalNode::from_page(raw);
        writeln!(
            out,
            "{}internal {} [{} keys]",
            indent,
            page_num,
            node.key_count()
        )
        .unwrap();

        self.format_subtree(table_id, node.leftmost_child(), depth + 1, out)?;
        for branch in node.branches() {
            writeln!(out, "{}* key {}", indent, branch.key).unwrap();
            self.format_subtree(table_id, branch.child, depth + 1, out)?;
        }
        Ok(())
    }
}
