/// One physical placement record: a contiguous run of element bytes living
/// at a fixed offset inside one of the dataset's files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// Index into the owning dataset's file list
    pub file_index: usize,
    /// Byte offset inside that file
    pub file_offset: u64,
    /// Byte offset inside the element, from the application's point of view
    pub app_offset: u64,
    /// Run length in bytes
    pub length: u64,
}

impl Segment {
    pub fn end(&self) -> u64 {
        self.app_offset + self.length
    }
}

/// One slice of a resolved read window. A `None` file index marks a hole;
/// holes are zero-filled by the reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub file_index: Option<usize>,
    pub file_offset: u64,
    pub app_offset: u64,
    pub length: u64,
}

/// Insert a segment keeping the array sorted by application offset.
/// Segments with an equal offset insert after existing ones, so a later
/// write shadows an earlier one during lookup.
pub fn add_segment(segments: &mut Vec<Segment>, segment: Segment) {
    let pos = segments.partition_point(|s| s.app_offset <= segment.app_offset);
    segments.insert(pos, segment);
}

/// Logical element size implied by a segment array.
pub fn logical_size(segments: &[Segment]) -> u64 {
    segments.iter().map(Segment::end).max().unwrap_or(0)
}

/// Coverage bookkeeping for lookup: disjoint, sorted mapped intervals.
#[derive(Debug, Clone, Copy)]
struct Cover {
    start: u64,
    end: u64,
    file_index: usize,
    file_offset: u64,
}

fn overwrite(cover: &mut Vec<Cover>, new: Cover) {
    let mut out = Vec::with_capacity(cover.len() + 2);
    for c in cover.drain(..) {
        if c.end <= new.start || c.start >= new.end {
            out.push(c);
            continue;
        }
        if c.start < new.start {
            out.push(Cover {
                start: c.start,
                end: new.start,
                file_index: c.file_index,
                file_offset: c.file_offset,
            });
        }
        if c.end > new.end {
            out.push(Cover {
                start: new.end,
                end: c.end,
                file_index: c.file_index,
                file_offset: c.file_offset + (new.end - c.start),
            });
        }
    }
    out.push(new);
    out.sort_by_key(|c| c.start);
    *cover = out;
}

/// Resolve a read window against a segment array. Returns the physical
/// slices intersecting `[app_offset, app_offset + length)` in ascending
/// order, with holes marked for zero-fill. Where segments overlap, the one
/// later in the array wins the overlapping byte range.
pub fn lookup(segments: &[Segment], app_offset: u64, length: u64) -> Vec<Extent> {
    let window_end = app_offset.saturating_add(length);
    let mut cover: Vec<Cover> = Vec::new();

    for seg in segments {
        let start = seg.app_offset.max(app_offset);
        let end = seg.end().min(window_end);
        if start >= end {
            continue;
        }
        overwrite(
            &mut cover,
            Cover {
                start,
                end,
                file_index: seg.file_index,
                file_offset: seg.file_offset + (start - seg.app_offset),
            },
        );
    }

    let mut extents = Vec::with_capacity(cover.len() * 2);
    let mut cursor = app_offset;
    for c in &cover {
        if c.start > cursor {
            extents.push(Extent {
                file_index: None,
                file_offset: 0,
                app_offset: cursor,
                length: c.start - cursor,
            });
        }
        extents.push(Extent {
            file_index: Some(c.file_index),
            file_offset: c.file_offset,
            app_offset: c.start,
            length: c.end - c.start,
        });
        cursor = c.end;
    }
    if cursor < window_end {
        extents.push(Extent {
            file_index: None,
            file_offset: 0,
            app_offset: cursor,
            length: window_end - cursor,
        });
    }

    extents
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(file_index: usize, file_offset: u64, app_offset: u64, length: u64) -> Segment {
        Segment {
            file_index,
            file_offset,
            app_offset,
            length,
        }
    }

    #[test]
    fn test_insert_keeps_sorted() {
        let mut segments = Vec::new();
        for (off, len) in [(100u64, 10u64), (0, 10), (50, 10), (25, 10), (50, 5)] {
            add_segment(&mut segments, seg(0, off, off, len));
        }
        let offsets: Vec<u64> = segments.iter().map(|s| s.app_offset).collect();
        let mut sorted = offsets.clone();
        sorted.sort();
        assert_eq!(offsets, sorted);
        // equal keys keep insertion order: the (50, 5) entry lands after (50, 10)
        assert_eq!(segments[3].length, 10);
        assert_eq!(segments[4].length, 5);
    }

    #[test]
    fn test_logical_size() {
        let mut segments = Vec::new();
        assert_eq!(logical_size(&segments), 0);
        add_segment(&mut segments, seg(0, 0, 0, 100));
        add_segment(&mut segments, seg(0, 100, 500, 50));
        assert_eq!(logical_size(&segments), 550);
    }

    #[test]
    fn test_lookup_exact_and_holes() {
        let mut segments = Vec::new();
        add_segment(&mut segments, seg(0, 1000, 10, 20));

        // fully inside the segment
        let extents = lookup(&segments, 15, 10);
        assert_eq!(extents.len(), 1);
        assert_eq!(extents[0].file_index, Some(0));
        assert_eq!(extents[0].file_offset, 1005);
        assert_eq!(extents[0].length, 10);

        // straddles both edges
        let extents = lookup(&segments, 0, 40);
        assert_eq!(extents.len(), 3);
        assert_eq!(extents[0].file_index, None);
        assert_eq!(extents[0].length, 10);
        assert_eq!(extents[1].file_index, Some(0));
        assert_eq!(extents[1].length, 20);
        assert_eq!(extents[2].file_index, None);
        assert_eq!(extents[2].length, 10);

        // entirely outside any segment
        let extents = lookup(&segments, 100, 8);
        assert_eq!(extents.len(), 1);
        assert_eq!(extents[0].file_index, None);
        assert_eq!(extents[0].length, 8);
    }

    #[test]
    fn test_lookup_later_segment_shadows() {
        let mut segments = Vec::new();
        add_segment(&mut segments, seg(0, 0, 50, 100));
        add_segment(&mut segments, seg(1, 0, 100, 100));

        let extents = lookup(&segments, 0, 200);
        // hole [0,50), old [50,100), new [100,200)
        assert_eq!(extents.len(), 3);
        assert_eq!(extents[0].file_index, None);
        assert_eq!(extents[0].length, 50);
        assert_eq!(extents[1].file_index, Some(0));
        assert_eq!(extents[1].app_offset, 50);
        assert_eq!(extents[1].length, 50);
        assert_eq!(extents[2].file_index, Some(1));
        assert_eq!(extents[2].app_offset, 100);
        assert_eq!(extents[2].length, 100);
    }

    #[test]
    fn test_lookup_full_rewrite_same_offset() {
        let mut segments = Vec::new();
        add_segment(&mut segments, seg(0, 0, 0, 64));
        add_segment(&mut segments, seg(0, 4096, 0, 64));

        let extents = lookup(&segments, 0, 64);
        assert_eq!(extents.len(), 1);
        assert_eq!(extents[0].file_offset, 4096);
    }

    #[test]
    fn test_lookup_interior_shadow_splits_old() {
        let mut segments = Vec::new();
        add_segment(&mut segments, seg(0, 0, 0, 100));
        add_segment(&mut segments, seg(1, 0, 40, 20));

        let extents = lookup(&segments, 0, 100);
        assert_eq!(extents.len(), 3);
        assert_eq!(extents[0], Extent {
            file_index: Some(0),
            file_offset: 0,
            app_offset: 0,
            length: 40,
        });
        assert_eq!(extents[1], Extent {
            file_index: Some(1),
            file_offset: 0,
            app_offset: 40,
            length: 20,
        });
        assert_eq!(extents[2], Extent {
            file_index: Some(0),
            file_offset: 60,
            app_offset: 60,
            length: 40,
        });
    }
}
