//! The compaction packer (spec.md §4.6): packs valid sub-pages gathered
//! from multiple sparsely-valid source pages into fewer destination
//! physical pages.

use crate::request::Slot;

/// One packed sub-page: either real data paired with its logical address,
/// or an explicit hole (logical address `-1`).
#[derive(Debug, Clone)]
pub enum PackedSlot {
    Data { buf: Vec<u8>, lpa: i64 },
    Hole,
}

/// A destination write record: up to K packed slots for one physical page.
#[derive(Debug, Clone, Default)]
pub struct WriteRecord {
    pub slots: Vec<PackedSlot>,
}

/// A source read page: K slots, each either live data with its logical
/// address or a hole.
pub struct ReadPage {
    pub slots: Vec<Slot>,
    pub lpas: Vec<i64>,
}

/// Packs the DATA slots of `pages` left-first into output records of width
/// `k`. Deterministic given input order; output preserves (buffer, logical
/// address) pairing; holes in outputs are explicitly marked with logical
/// address `-1`. The union of DATA slots across outputs is exactly the
/// union of DATA slots across inputs.
///
/// This performs only the packing step of the contract described in
/// spec.md §4.6; the final fix-up pass that splits remaining DATA slots of
/// the last output into additional per-column records (needed only by the
/// recycle engine's one-for-one path, which targets a single destination
/// column rather than a freshly packed page) is [`split_for_column`].
pub fn pack(pages: &[ReadPage], k: usize) -> Vec<WriteRecord> {
    let mut data_items: Vec<(Vec<u8>, i64)> = Vec::new();
    for page in pages {
        for (slot, &lpa) in page.slots.iter().zip(page.lpas.iter()) {
            if let Slot::Data(buf) = slot {
                data_items.push((buf.clone(), lpa));
            }
        }
    }

    if data_items.is_empty() {
        return Vec::new();
    }

    let mut records = Vec::new();
    for chunk in data_items.chunks(k) {
        let mut rec = WriteRecord { slots: Vec::with_capacity(k) };
        for (buf, lpa) in chunk {
            rec.slots.push(PackedSlot::Data { buf: buf.clone(), lpa: *lpa });
        }
        while rec.slots.len() < k {
            rec.slots.push(PackedSlot::Hole);
        }
        records.push(rec);
    }
    records
}

/// Splits a single packed record that is destined for one specific
/// physical sub-page column (`ofs`) into one record per DATA slot, each
/// carrying its own destination column. Used when the recycle engine packs
/// a batch that must still land one slot per destination page rather than
/// co-resident on one physical page.
pub fn split_for_column(rec: &WriteRecord) -> Vec<(usize, PackedSlot)> {
    rec.slots
        .iter()
        .enumerate()
        .filter(|(_, s)| matches!(s, PackedSlot::Data { .. }))
        .map(|(i, s)| (i, s.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(data: &[(Option<&[u8]>, i64)]) -> ReadPage {
        let mut slots = Vec::new();
        let mut lpas = Vec::new();
        for (buf, lpa) in data {
            match buf {
                Some(b) => slots.push(Slot::Data(b.to_vec())),
                None => slots.push(Slot::Hole),
            }
            lpas.push(*lpa);
        }
        ReadPage { slots, lpas }
    }

    #[test]
    fn packs_sparse_pages_left_first() {
        let pages = vec![
            page(&[(Some(b"a"), 0), (None, -1), (Some(b"b"), 2), (None, -1)]),
            page(&[(None, -1), (Some(b"c"), 5), (None, -1), (None, -1)]),
        ];
        let records = pack(&pages, 4);
        assert_eq!(records.len(), 1);
        let rec = &records[0];
        assert!(matches!(&rec.slots[0], PackedSlot::Data { lpa: 0, .. }));
        assert!(matches!(&rec.slots[1], PackedSlot::Data { lpa: 2, .. }));
        assert!(matches!(&rec.slots[2], PackedSlot::Data { lpa: 5, .. }));
        assert!(matches!(&rec.slots[3], PackedSlot::Hole));
    }

    #[test]
    fn overflow_spills_into_second_record() {
        let pages = vec![page(&[
            (Some(b"a"), 0),
            (Some(b"b"), 1),
            (Some(b"c"), 2),
            (Some(b"d"), 3),
        ])];
        let pages2 = vec![page(&[(Some(b"e"), 4), (None, -1), (None, -1), (None, -1)])];
        let mut all = pages;
        all.extend(pages2);
        let records = pack(&all, 4);
        assert_eq!(records.len(), 2);
        assert!(matches!(&records[1].slots[0], PackedSlot::Data { lpa: 4, .. }));
        assert!(matches!(&records[1].slots[1], PackedSlot::Hole));
    }

    #[test]
    fn empty_input_yields_no_records() {
        let pages = vec![page(&[(None, -1), (None, -1), (None, -1), (None, -1)])];
        assert!(pack(&pages, 4).is_empty());
    }
}
