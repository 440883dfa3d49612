//! Grant tables.
//!
//! A domain exposes one of its frames to a named peer by granting it. The
//! grant lives in the granting (origin) domain's table under a reference
//! number; the peer maps it by presenting (reference, origin), and the frame
//! shows up in a page of the peer's grant window, a small run of IPA pages
//! reserved right after its control page.
//!
//! Reference numbers are unique only within their origin domain, so every
//! lookup is qualified by (reference, origin, target).
//!
//! Locks are taken in the order origin table, importer grant window,
//! importer stage-2 table.
use crate::{
    domain::Domain,
    error::Result,
    mm::{stage2::S2PteFlags, NR_GRANT_IPA_SLOTS},
    Avz, AvzError, DomId,
};
use abyss::addressing::{Ipa, Pa, PAGE_SIZE};
use alloc::{collections::BTreeMap, vec::Vec};

pub type GrantRef = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GrantEntry {
    pub origin: DomId,
    pub target: DomId,
    /// Granted frame.
    pub pfn: usize,
    pub gref: GrantRef,
    /// IPA frame of the target the grant is mapped at.
    pub mapped: Option<usize>,
}

/// Grants of one domain.
#[derive(Default)]
pub struct GrantTable {
    entries: BTreeMap<GrantRef, GrantEntry>,
}

impl GrantTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, gref: GrantRef) -> Option<&GrantEntry> {
        self.entries.get(&gref)
    }

    fn next_ref(&self) -> GrantRef {
        self.entries.keys().next_back().map_or(1, |r| r + 1)
    }
}

/// Grant window of one domain.
pub struct GrantIpaPool {
    base: Option<Ipa>,
    /// Grant mapped in each page of the window.
    slots: [Option<(DomId, GrantRef)>; NR_GRANT_IPA_SLOTS],
}

impl GrantIpaPool {
    pub fn new() -> Self {
        Self {
            base: None,
            slots: [None; NR_GRANT_IPA_SLOTS],
        }
    }

    /// Place the window at `base` with every page free.
    pub(crate) fn reset(&mut self, base: Ipa) {
        self.base = Some(base);
        self.slots = [None; NR_GRANT_IPA_SLOTS];
    }

    /// Number of pages holding a grant.
    pub fn in_use(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    fn window(&self) -> impl Iterator<Item = Ipa> + '_ {
        self.base
            .into_iter()
            .flat_map(|base| (0..NR_GRANT_IPA_SLOTS).map(move |i| base + i * PAGE_SIZE))
    }

    fn index_of(&self, ipa_pfn: usize) -> Option<usize> {
        let base = self.base?.pfn();
        (base..base + NR_GRANT_IPA_SLOTS)
            .contains(&ipa_pfn)
            .then(|| ipa_pfn - base)
    }

    fn alloc(&mut self, origin: DomId, gref: GrantRef) -> Option<Ipa> {
        let base = self.base?;
        let idx = self.slots.iter().position(|s| s.is_none())?;
        self.slots[idx] = Some((origin, gref));
        Some(base + idx * PAGE_SIZE)
    }

    fn lookup(&self, ipa_pfn: usize) -> Option<(DomId, GrantRef)> {
        self.slots[self.index_of(ipa_pfn)?]
    }
}

impl Default for GrantIpaPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Avz {
    /// Let `target` map frame `pfn` of `origin`. Returns the reference.
    pub fn gnttab_grant(&self, origin: &Domain, target: DomId, pfn: usize) -> Result<GrantRef> {
        if self.domain(target).is_none() {
            return Err(AvzError::InvalidDomain(target));
        }
        let layout = origin.layout().ok_or(AvzError::Invalid)?;
        let frame = Pa::from_pfn(pfn);
        if frame < layout.base || frame - layout.base >= layout.size {
            return Err(AvzError::Invalid);
        }
        let mut table = origin.gnttab.lock();
        let gref = table.next_ref();
        table.entries.insert(
            gref,
            GrantEntry {
                origin: origin.domain_id,
                target,
                pfn,
                gref,
                mapped: None,
            },
        );
        log::debug!(
            "{}: grant {} of pfn 0x{:x} to {}",
            origin.domain_id,
            gref,
            pfn,
            target
        );
        Ok(gref)
    }

    /// Withdraw grant `gref` of `origin`, unmapping it from its target.
    ///
    /// Revoking from an empty table does nothing: a migration reset empties
    /// the table under a domain that still holds references.
    pub fn gnttab_revoke(&self, origin: &Domain, gref: GrantRef) -> Result<()> {
        let mut table = origin.gnttab.lock();
        if table.is_empty() {
            return Ok(());
        }
        let entry = table
            .entries
            .remove(&gref)
            .unwrap_or_else(|| bug!("{}: revoking unknown grant {}", origin.domain_id, gref));
        if let (Some(ipa_pfn), Some(importer)) = (entry.mapped, self.domain(entry.target)) {
            self.unmap_import(&importer, ipa_pfn);
        }
        log::debug!("{}: grant {} revoked", origin.domain_id, gref);
        Ok(())
    }

    /// Map grant `gref` of `origin` into `importer`'s grant window. Returns
    /// the IPA frame it is mapped at.
    pub fn gnttab_map(&self, importer: &Domain, gref: GrantRef, origin: DomId) -> Result<usize> {
        let o = self
            .domain(origin)
            .ok_or(AvzError::InvalidDomain(origin))?;
        let mut table = o.gnttab.lock();
        let entry = table
            .entries
            .get_mut(&gref)
            .filter(|e| e.origin == origin && e.target == importer.domain_id)
            .ok_or(AvzError::NoMatchingGrant)?;
        if entry.mapped.is_some() {
            return Err(AvzError::Busy);
        }

        let mut pool = importer.grant_ipa.lock();
        let mut mm = importer.mm.lock();
        let pt = mm.as_mut().ok_or(AvzError::Invalid)?;
        let ipa = pool
            .alloc(origin, gref)
            .unwrap_or_else(|| bug!("{}: grant IPA slots exhausted", importer.domain_id));
        pt.map(ipa, Pa::from_pfn(entry.pfn), S2PteFlags::RW)
            .unwrap_or_else(|e| bug!("{}: cannot map grant at {:?}: {:?}", importer.domain_id, ipa, e));
        entry.mapped = Some(ipa.pfn());
        log::debug!(
            "{}: grant {}:{} mapped at {:?}",
            importer.domain_id,
            origin,
            gref,
            ipa
        );
        Ok(ipa.pfn())
    }

    /// Unmap the grant mapped at IPA frame `ipa_pfn` of `importer`.
    pub fn gnttab_unmap(&self, importer: &Domain, ipa_pfn: usize) -> Result<()> {
        let (origin, gref) = importer
            .grant_ipa
            .lock()
            .lookup(ipa_pfn)
            .ok_or(AvzError::Invalid)?;
        match self.domain(origin) {
            Some(o) => {
                let mut table = o.gnttab.lock();
                if let Some(e) = table.entries.get_mut(&gref) {
                    if e.target == importer.domain_id && e.mapped == Some(ipa_pfn) {
                        e.mapped = None;
                    }
                }
                self.unmap_import(importer, ipa_pfn);
            }
            None => {
                self.unmap_import(importer, ipa_pfn);
            }
        }
        Ok(())
    }

    /// Drop every grant of `d` and empty its grant window.
    pub fn gnttab_reset(&self, d: &Domain) {
        let entries: Vec<_> = core::mem::take(&mut d.gnttab.lock().entries)
            .into_values()
            .collect();
        for e in entries {
            if let (Some(ipa_pfn), Some(importer)) = (e.mapped, self.domain(e.target)) {
                self.unmap_import(&importer, ipa_pfn);
            }
        }

        let imports: Vec<_> = {
            let pool = d.grant_ipa.lock();
            pool.window()
                .filter(|ipa| pool.lookup(ipa.pfn()).is_some())
                .map(|ipa| ipa.pfn())
                .collect()
        };
        for ipa_pfn in imports {
            let _ = self.gnttab_unmap(d, ipa_pfn);
        }

        // A restored image may carry mappings of the host it came from. Its
        // table still points there until the fixup.
        let mut pool = d.grant_ipa.lock();
        let stale = d.image_pfn.lock().is_some();
        if let Some(pt) = d.mm.lock().as_mut().filter(|_| !stale) {
            for ipa in pool.window() {
                pt.unmap_if_mapped(ipa)
                    .unwrap_or_else(|e| bug!("{}: cannot unmap {:?}: {:?}", d.domain_id, ipa, e));
            }
            self.mmu.flush_tlb_all();
        }
        if let Some(base) = pool.base {
            pool.reset(base);
        }
    }

    /// Free the window page at `ipa_pfn` of `importer` and remove its mapping.
    fn unmap_import(&self, importer: &Domain, ipa_pfn: usize) {
        let mut pool = importer.grant_ipa.lock();
        let idx = match pool.index_of(ipa_pfn) {
            Some(idx) => idx,
            None => return,
        };
        pool.slots[idx] = None;
        if let Some(pt) = importer.mm.lock().as_mut() {
            let ipa = Ipa::from_pfn(ipa_pfn);
            pt.unmap_if_mapped(ipa)
                .unwrap_or_else(|e| bug!("{}: cannot unmap {:?}: {:?}", importer.domain_id, ipa, e));
        }
        self.mmu.flush_tlb_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::AvzConfig, AvzBuilder, ME_CHUNK_SIZE};
    use alloc::sync::Arc;

    fn setup() -> (Avz, Arc<Domain>, Arc<Domain>) {
        let avz = AvzBuilder::new(AvzConfig::builder().build().unwrap()).finalize();
        let me = avz.domain(avz.allocate_me_slot(ME_CHUNK_SIZE).unwrap()).unwrap();
        let layout = me.layout().unwrap();
        avz.setup_domain_page_table(&me, layout.base, layout.size);
        let agency = avz.agency();
        (avz, agency, me)
    }

    fn agency_pfn(avz: &Avz, page: usize) -> usize {
        avz.config().agency_base().pfn() + page
    }

    #[test]
    fn refs_count_from_one() {
        let (avz, agency, me) = setup();
        let refs: Vec<_> = (0..5)
            .map(|i| avz.gnttab_grant(&agency, me.domain_id, agency_pfn(&avz, i)).unwrap())
            .collect();
        assert_eq!(refs, [1, 2, 3, 4, 5]);
        avz.gnttab_revoke(&agency, 2).unwrap();
        assert_eq!(
            avz.gnttab_grant(&agency, me.domain_id, agency_pfn(&avz, 9)),
            Ok(6)
        );
        avz.gnttab_revoke(&agency, 6).unwrap();
        avz.gnttab_revoke(&agency, 5).unwrap();
        assert_eq!(
            avz.gnttab_grant(&agency, me.domain_id, agency_pfn(&avz, 9)),
            Ok(5)
        );
    }

    #[test]
    fn frames_outside_the_slot_cannot_be_granted() {
        let (avz, agency, me) = setup();
        let layout = me.layout().unwrap();
        assert_eq!(
            avz.gnttab_grant(&me, DomId::AGENCY, layout.base.pfn() - 1),
            Err(AvzError::Invalid)
        );
        assert_eq!(
            avz.gnttab_grant(&agency, DomId(40), agency_pfn(&avz, 0)),
            Err(AvzError::InvalidDomain(DomId(40)))
        );
    }

    #[test]
    fn map_lands_in_the_grant_window() {
        let (avz, agency, me) = setup();
        let pfn = agency_pfn(&avz, 3);
        let gref = avz.gnttab_grant(&agency, me.domain_id, pfn).unwrap();
        let ipa_pfn = avz.gnttab_map(&me, gref, DomId::AGENCY).unwrap();
        let layout = me.layout().unwrap();
        assert_eq!(ipa_pfn, layout.grant_ipa_base().pfn());
        assert_eq!(
            avz.translate(&me, Ipa::from_pfn(ipa_pfn)),
            Ok(Pa::from_pfn(pfn))
        );
        assert_eq!(
            avz.gnttab_map(&me, gref, DomId::AGENCY),
            Err(AvzError::Busy)
        );

        avz.gnttab_unmap(&me, ipa_pfn).unwrap();
        assert!(avz.translate(&me, Ipa::from_pfn(ipa_pfn)).is_err());
        assert_eq!(me.grant_ipa.lock().in_use(), 0);
        assert_eq!(agency.gnttab.lock().get(gref).unwrap().mapped, None);
    }

    #[test]
    fn lookup_is_qualified_by_target() {
        let (avz, agency, me) = setup();
        let other = avz.domain(avz.allocate_me_slot(ME_CHUNK_SIZE).unwrap()).unwrap();
        let gref = avz
            .gnttab_grant(&agency, other.domain_id, agency_pfn(&avz, 0))
            .unwrap();
        assert_eq!(
            avz.gnttab_map(&me, gref, DomId::AGENCY),
            Err(AvzError::NoMatchingGrant)
        );
    }

    #[test]
    fn revoke_tears_the_mapping_down() {
        let (avz, agency, me) = setup();
        let gref = avz
            .gnttab_grant(&agency, me.domain_id, agency_pfn(&avz, 1))
            .unwrap();
        let ipa_pfn = avz.gnttab_map(&me, gref, DomId::AGENCY).unwrap();
        avz.gnttab_revoke(&agency, gref).unwrap();
        assert!(avz.translate(&me, Ipa::from_pfn(ipa_pfn)).is_err());
        assert_eq!(me.grant_ipa.lock().in_use(), 0);
        // Empty table.
        avz.gnttab_revoke(&agency, gref).unwrap();
    }

    #[test]
    #[should_panic]
    fn revoking_an_unknown_ref_halts() {
        let (avz, agency, me) = setup();
        avz.gnttab_grant(&agency, me.domain_id, agency_pfn(&avz, 0))
            .unwrap();
        let _ = avz.gnttab_revoke(&agency, 7);
    }

    #[test]
    #[should_panic]
    fn grant_window_exhaustion_halts() {
        let (avz, agency, me) = setup();
        for i in 0..=NR_GRANT_IPA_SLOTS {
            let gref = avz
                .gnttab_grant(&agency, me.domain_id, agency_pfn(&avz, i))
                .unwrap();
            let _ = avz.gnttab_map(&me, gref, DomId::AGENCY);
        }
    }

    #[test]
    fn reset_drops_grants_and_imports() {
        let (avz, agency, me) = setup();
        let gref = avz
            .gnttab_grant(&agency, me.domain_id, agency_pfn(&avz, 1))
            .unwrap();
        let ipa_pfn = avz.gnttab_map(&me, gref, DomId::AGENCY).unwrap();
        let layout = me.layout().unwrap();
        let back = avz
            .gnttab_grant(&me, DomId::AGENCY, layout.base.pfn())
            .unwrap();
        avz.gnttab_reset(&me);
        assert!(me.gnttab.lock().is_empty());
        assert_eq!(me.grant_ipa.lock().in_use(), 0);
        assert!(avz.translate(&me, Ipa::from_pfn(ipa_pfn)).is_err());
        assert_eq!(agency.gnttab.lock().get(gref).unwrap().mapped, None);
        // Revoking after a reset is quiet.
        avz.gnttab_revoke(&me, back).unwrap();
    }
}
