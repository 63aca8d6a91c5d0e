// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::sync::Arc;

use io_pgtable::{
    ConfigError, Format, GIB, IoPgtableCfg, IoPgtableOps, Iova, KIB, MIB, MapError, PageSizes,
    PhysicalAddress, Prot, Quirks, SgEntry, TlbOps, alloc_io_pgtable_ops, free_io_pgtable_ops,
};
use parking_lot::Mutex;
use proptest::prelude::*;

const RW: Prot = Prot::READ.union(Prot::WRITE);

/// The cookie handed to every allocation, identifying the "domain" in the callbacks.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
struct Domain(u32);

#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    FlushAll(Domain),
    AddFlush {
        iova: Iova,
        size: usize,
        leaf: bool,
    },
    Sync(Domain),
}

#[derive(Default)]
struct Tlb {
    events: Mutex<Vec<Event>>,
}

impl Tlb {
    fn take(&self) -> Vec<Event> {
        std::mem::take(&mut *self.events.lock())
    }
}

impl TlbOps<Domain> for Tlb {
    fn tlb_flush_all(&self, cookie: &Domain) {
        self.events.lock().push(Event::FlushAll(*cookie));
    }

    fn tlb_add_flush(&self, iova: Iova, size: usize, _granule: usize, leaf: bool, _cookie: &Domain) {
        self.events.lock().push(Event::AddFlush { iova, size, leaf });
    }

    fn tlb_sync(&self, cookie: &Domain) {
        self.events.lock().push(Event::Sync(*cookie));
    }
}

fn alloc(
    fmt: Format,
    page_sizes: PageSizes,
    ias: u32,
    oas: u32,
) -> (Arc<Tlb>, Box<dyn IoPgtableOps<Domain>>) {
    let tlb = Arc::new(Tlb::default());
    let mut cfg = IoPgtableCfg::<Domain>::new(page_sizes, ias, oas).with_tlb(tlb.clone());
    let ops = alloc_io_pgtable_ops(fmt, &mut cfg, Domain(7)).unwrap();
    (tlb, ops)
}

/// Asserts that `events` is a batch of range invalidations terminated by exactly one sync.
fn assert_flushed_then_synced(events: &[Event]) {
    let Some((last, flushes)) = events.split_last() else {
        panic!("no TLB maintenance was performed");
    };

    assert_eq!(*last, Event::Sync(Domain(7)));
    assert!(!flushes.is_empty());
    assert!(
        flushes
            .iter()
            .all(|event| matches!(event, Event::AddFlush { .. })),
        "unexpected events {events:?}"
    );
}

#[test_log::test]
fn map_translate_unmap() {
    let (tlb, ops) = alloc(Format::ArmLpae64S1, PageSizes::from_bits(4 * KIB), 48, 40);

    ops.map(
        Iova::new(0x1000),
        PhysicalAddress::new(0x2000),
        3 * 4 * KIB,
        RW,
    )
    .unwrap();
    assert_eq!(
        ops.iova_to_phys(Iova::new(0x1500)),
        Some(PhysicalAddress::new(0x2500))
    );
    tlb.take();

    assert_eq!(ops.unmap(Iova::new(0x1000), 2 * 4 * KIB), 8192);
    assert_eq!(ops.iova_to_phys(Iova::new(0x1000)), None);
    assert_eq!(ops.iova_to_phys(Iova::new(0x2fff)), None);
    assert_eq!(
        ops.iova_to_phys(Iova::new(0x3000)),
        Some(PhysicalAddress::new(0x4000))
    );

    assert_eq!(
        tlb.take(),
        [
            Event::AddFlush {
                iova: Iova::new(0x1000),
                size: 0x2000,
                leaf: true
            },
            Event::Sync(Domain(7)),
        ]
    );

    free_io_pgtable_ops(ops);
    assert_eq!(tlb.take(), [Event::FlushAll(Domain(7))]);
}

#[test_log::test]
fn unmap_invalidates_before_returning() {
    for fmt in [
        Format::ArmLpae32S1,
        Format::ArmLpae32S2,
        Format::ArmLpae64S1,
        Format::ArmLpae64S2,
    ] {
        let (tlb, ops) = alloc(
            fmt,
            PageSizes::from_iter([4 * KIB, 2 * MIB, GIB]),
            32,
            40,
        );

        // a block followed by a few pages
        ops.map(
            Iova::new(0x20_0000),
            PhysicalAddress::new(0x4000_0000),
            2 * MIB + 3 * 4 * KIB,
            RW,
        )
        .unwrap();
        tlb.take();

        // covers part of the block only, which has to be split
        let unmapped = ops.unmap(Iova::new(0x30_0000), MIB);
        assert_eq!(unmapped, MIB, "{fmt}");
        assert_flushed_then_synced(&tlb.take());

        assert_eq!(
            ops.iova_to_phys(Iova::new(0x20_0000)),
            Some(PhysicalAddress::new(0x4000_0000))
        );
        assert_eq!(ops.iova_to_phys(Iova::new(0x30_0000)), None);
        assert_eq!(
            ops.iova_to_phys(Iova::new(0x40_2000)),
            Some(PhysicalAddress::new(0x4020_2000))
        );

        free_io_pgtable_ops(ops);
    }
}

#[test_log::test]
fn map_sg_reports_partial_progress() {
    let (tlb, ops) = alloc(Format::ArmLpae64S1, PageSizes::from_bits(4 * KIB), 48, 48);

    // the third segment will collide with this
    ops.map(
        Iova::new(0x1_3000),
        PhysicalAddress::new(0x9000_0000),
        4 * KIB,
        RW,
    )
    .unwrap();
    tlb.take();

    let sg = [
        SgEntry::new(PhysicalAddress::new(0x10_0000), 4 * KIB),
        SgEntry::new(PhysicalAddress::new(0x20_0000), 2 * 4 * KIB),
        SgEntry::new(PhysicalAddress::new(0x30_0000), 2 * 4 * KIB),
        SgEntry::new(PhysicalAddress::new(0x40_0000), 4 * KIB),
        SgEntry::new(PhysicalAddress::new(0x50_0000), 4 * KIB),
    ];

    let err = ops.map_sg(Iova::new(0x1_0000), &sg, RW).unwrap_err();
    assert_eq!(err.mapped, 3 * 4 * KIB);
    assert_eq!(err.error, MapError::Exists);

    assert_eq!(
        ops.iova_to_phys(Iova::new(0x1_0010)),
        Some(PhysicalAddress::new(0x10_0010))
    );
    assert_eq!(
        ops.iova_to_phys(Iova::new(0x1_2fff)),
        Some(PhysicalAddress::new(0x20_1fff))
    );
    // the colliding mapping is untouched
    assert_eq!(
        ops.iova_to_phys(Iova::new(0x1_3000)),
        Some(PhysicalAddress::new(0x9000_0000))
    );
    assert_eq!(ops.iova_to_phys(Iova::new(0x1_5000)), None);

    // the caller cleans up the prefix
    assert_eq!(ops.unmap(Iova::new(0x1_0000), err.mapped), err.mapped);
    assert_eq!(ops.iova_to_phys(Iova::new(0x1_0000)), None);

    free_io_pgtable_ops(ops);
}

#[test]
fn map_sg_maps_everything() {
    let (_tlb, ops) = alloc(
        Format::ArmLpae64S2,
        PageSizes::from_iter([4 * KIB, 2 * MIB]),
        40,
        40,
    );

    let sg = [
        SgEntry::new(PhysicalAddress::new(0x8000_0000), 2 * MIB),
        SgEntry::new(PhysicalAddress::new(0x1000), 4 * KIB),
    ];
    assert_eq!(
        ops.map_sg(Iova::new(0x4000_0000), &sg, RW),
        Ok(2 * MIB + 4 * KIB)
    );
    assert_eq!(
        ops.iova_to_phys(Iova::new(0x4020_0fff)),
        Some(PhysicalAddress::new(0x1fff))
    );

    free_io_pgtable_ops(ops);
}

#[test]
fn rejects_unsupported_quirks() {
    let cases: &[(Format, Quirks)] = &[
        (Format::ArmLpae64S1, Quirks::NO_PERMS),
        (Format::ArmLpae64S1, Quirks::TLBI_ON_MAP),
        (Format::ArmLpae64S1, Quirks::ARM_MTK_4GB),
        (Format::ArmLpae32S1, Quirks::NO_PERMS),
        (Format::ArmLpae64S2, Quirks::ARM_NS),
        (Format::ArmLpae64S2, Quirks::NON_SHAREABLE),
        (Format::ArmLpae32S2, Quirks::USE_LLC_NWA),
        (Format::ArmV7s, Quirks::NON_SHAREABLE),
        (Format::ArmV7s, Quirks::USE_UPSTREAM_HINT),
        (Format::Av8lFast, Quirks::ARM_NS),
        (Format::Av8lFast, Quirks::TLBI_ON_MAP),
    ];

    for (fmt, quirks) in cases {
        let tlb = Arc::new(Tlb::default());
        let mut cfg = IoPgtableCfg::<Domain>::new(PageSizes::from_bits(4 * KIB), 32, 32)
            .with_tlb(tlb.clone())
            .with_quirks(*quirks);

        let res = alloc_io_pgtable_ops(*fmt, &mut cfg, Domain(1));
        assert!(
            matches!(res, Err(ConfigError::UnsupportedQuirks { quirks: q }) if q == *quirks),
            "{fmt} accepted {quirks:?}"
        );
        assert!(cfg.format_cfg().is_none());
    }
}

#[test]
fn conflicting_walk_attributes() {
    let mut cfg = IoPgtableCfg::<Domain>::new(PageSizes::from_bits(4 * KIB), 48, 48)
        .with_quirks(Quirks::NON_SHAREABLE | Quirks::USE_UPSTREAM_HINT);

    assert!(matches!(
        alloc_io_pgtable_ops(Format::ArmLpae64S1, &mut cfg, Domain(1)),
        Err(ConfigError::IncompatibleQuirks)
    ));
}

#[test_log::test]
fn fresh_maps_need_no_invalidation() {
    let tlb = Arc::new(Tlb::default());
    let mut cfg = IoPgtableCfg::<Domain>::new(PageSizes::from_bits(4 * KIB), 48, 48)
        .with_tlb(tlb.clone());
    let ops = alloc_io_pgtable_ops(Format::ArmLpae64S1, &mut cfg, Domain(7)).unwrap();

    ops.map(
        Iova::new(0x1000),
        PhysicalAddress::new(0x1000),
        4 * KIB,
        RW,
    )
    .unwrap();
    // without the quirk a map of fresh entries needs no invalidation
    assert!(tlb.take().is_empty());

    free_io_pgtable_ops(ops);
}

#[test]
fn no_access_maps_nothing() {
    let (tlb, ops) = alloc(Format::ArmLpae64S1, PageSizes::from_bits(4 * KIB), 48, 48);
    tlb.take();

    ops.map(
        Iova::new(0x1000),
        PhysicalAddress::new(0x1000),
        4 * KIB,
        Prot::NOEXEC,
    )
    .unwrap();
    assert_eq!(ops.iova_to_phys(Iova::new(0x1000)), None);
    assert_eq!(ops.iova_to_pte(Iova::new(0x1000)), 0);
    assert!(!ops.is_iova_coherent(Iova::new(0x1000)));
}

#[test]
fn rejects_bad_arguments() {
    let (_tlb, ops) = alloc(Format::ArmLpae64S1, PageSizes::from_bits(4 * KIB), 32, 32);

    assert_eq!(
        ops.map(Iova::new(0x1800), PhysicalAddress::new(0x1000), 4 * KIB, RW),
        Err(MapError::Misaligned)
    );
    assert_eq!(
        ops.map(Iova::new(0x1000), PhysicalAddress::new(0x1000), 0x800, RW),
        Err(MapError::Misaligned)
    );
    assert_eq!(
        ops.map(
            Iova::new(0xffff_f000),
            PhysicalAddress::new(0x1000),
            2 * 4 * KIB,
            RW
        ),
        Err(MapError::OutOfRange)
    );
    assert_eq!(
        ops.map(
            Iova::new(0x1000),
            PhysicalAddress::new(0x1_0000_0000),
            4 * KIB,
            RW
        ),
        Err(MapError::OutOfRange)
    );
    assert_eq!(ops.unmap(Iova::new(0x1800), 4 * KIB), 0);
}

#[test]
fn coherency_follows_cache_attribute() {
    let (_tlb, ops) = alloc(Format::ArmLpae64S1, PageSizes::from_bits(4 * KIB), 48, 48);

    ops.map(
        Iova::new(0x1000),
        PhysicalAddress::new(0x1000),
        4 * KIB,
        RW | Prot::CACHE,
    )
    .unwrap();
    ops.map(
        Iova::new(0x2000),
        PhysicalAddress::new(0x2000),
        4 * KIB,
        RW,
    )
    .unwrap();

    assert!(ops.is_iova_coherent(Iova::new(0x1000)));
    assert!(!ops.is_iova_coherent(Iova::new(0x2000)));
    assert!(!ops.is_iova_coherent(Iova::new(0x3000)));
    assert_ne!(ops.iova_to_pte(Iova::new(0x1000)), 0);
    assert_ne!(
        ops.iova_to_pte(Iova::new(0x1000)),
        ops.iova_to_pte(Iova::new(0x2000))
    );
}

fn page_sizes() -> impl Strategy<Value = PageSizes> {
    prop::sample::subsequence(
        vec![4 * KIB, 16 * KIB, 64 * KIB, 2 * MIB, 32 * MIB, 512 * MIB, GIB],
        1..=4,
    )
    .prop_map(PageSizes::from_iter)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn narrowing_is_idempotent(
        sizes in page_sizes(),
        fmt in prop::sample::select(vec![Format::ArmLpae64S1, Format::ArmLpae64S2, Format::ArmLpae32S1]),
    ) {
        let mut first = IoPgtableCfg::<Domain>::new(sizes, 32, 40);
        let mut second = IoPgtableCfg::<Domain>::new(sizes, 32, 40);

        let a = alloc_io_pgtable_ops(fmt, &mut first, Domain(1));
        let b = alloc_io_pgtable_ops(fmt, &mut second, Domain(2));

        prop_assert_eq!(a.is_ok(), b.is_ok());
        prop_assert_eq!(first.page_sizes, second.page_sizes);
        prop_assert_eq!(
            first.format_cfg().map(std::mem::discriminant),
            second.format_cfg().map(std::mem::discriminant)
        );

        if let Ok(ops) = a {
            // narrowed to a subset of what was asked for
            prop_assert_eq!(first.page_sizes.intersection(sizes), first.page_sizes);

            // allocating with the narrowed result grants the same again
            let mut again = first.clone();
            let c = alloc_io_pgtable_ops(fmt, &mut again, Domain(3));
            prop_assert!(c.is_ok());
            prop_assert_eq!(again.page_sizes, first.page_sizes);
            free_io_pgtable_ops(ops);
        }
    }

    #[test]
    fn map_unmap_round_trip(
        iova_page in 0usize..(1 << 16),
        paddr_page in 0usize..(1 << 16),
        pages in 1usize..1100,
        block_aligned in any::<bool>(),
        offset in any::<prop::sample::Index>(),
    ) {
        let (_tlb, ops) = alloc(Format::ArmLpae64S1, PageSizes::from_iter([4 * KIB, 2 * MIB]), 40, 40);

        let (iova, paddr) = if block_aligned {
            (Iova::new(iova_page * 2 * MIB), PhysicalAddress::new(paddr_page * 2 * MIB))
        } else {
            (Iova::new(iova_page * 4 * KIB), PhysicalAddress::new(paddr_page * 4 * KIB))
        };
        let size = pages * 4 * KIB;

        prop_assert_eq!(ops.map(iova, paddr, size, RW), Ok(()));

        for k in [0, size - 1, offset.index(size)] {
            prop_assert_eq!(ops.iova_to_phys(iova.add(k)), Some(paddr.add(k)));
        }
        prop_assert_eq!(ops.iova_to_phys(iova.add(size)), None);

        prop_assert_eq!(ops.unmap(iova, size), size);
        prop_assert_eq!(ops.iova_to_phys(iova), None);
        prop_assert_eq!(ops.iova_to_phys(iova.add(size - 1)), None);

        free_io_pgtable_ops(ops);
    }
}
