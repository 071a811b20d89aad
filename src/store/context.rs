//! store/context — shared state of an open store.
//!
//! Owns the zone set, the last durable germ, the page cache and the metrics.
//! The database writes chunks and germs through it, and every tree reads
//! persisted pages through its `PageLoader` impl.

use anyhow::{anyhow, Result};
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::hash::Hasher;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::thread;
use std::time::Duration;
use twox_hash::XxHash64;

use crate::config::StoreConfig;
use crate::consts::ZONE_HEAD_SIZE;
use crate::error::TreeError;
use crate::metrics::StoreMetrics;
use crate::page::block::decode_block;
use crate::page::{CachedPage, PageAddr, PageLoader};
use crate::store::cache::PageCache;
use crate::store::germ::Germ;
use crate::store::zone::{list_zone_ids, Zone};

pub(crate) struct StoreContext {
    dir: PathBuf,
    config: StoreConfig,
    zones: RwLock<BTreeMap<u32, Arc<Zone>>>,
    /// Retired zones waiting out the delete delay; still readable.
    retiring: Mutex<BTreeMap<u32, Arc<Zone>>>,
    germ: Mutex<Germ>,
    cache: Mutex<PageCache>,
    metrics: Arc<StoreMetrics>,
}

fn new_store_id(dir: &Path) -> u64 {
    let mut h = XxHash64::with_seed(0);
    h.write(dir.to_string_lossy().as_bytes());
    h.write_u128(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0),
    );
    h.write_u32(std::process::id());
    h.finish()
}

impl StoreContext {
    /// Open every zone in `dir` and recover the germ of the newest one. An
    /// empty directory gets zone 0 with a fresh germ.
    pub(crate) fn open(dir: &Path, config: StoreConfig) -> Result<Arc<StoreContext>> {
        let mut zones = BTreeMap::new();
        let ids = list_zone_ids(dir)?;
        let germ = if ids.is_empty() {
            let germ = Germ::fresh(new_store_id(dir));
            let zone = Zone::create(dir, 0, &germ, config.data_fsync)?;
            info!("created store {:016x} in {}", germ.store_id, dir.display());
            zones.insert(0, Arc::new(zone));
            germ
        } else {
            for id in &ids {
                zones.insert(*id, Arc::new(Zone::open(dir, *id)?));
            }
            let newest = ids[ids.len() - 1];
            let germ = zones
                .get(&newest)
                .ok_or_else(|| anyhow!("zone {} vanished while opening", newest))?
                .read_germ()?;
            info!(
                "opened store {:016x} in {}: {} zone(s), version {}, {} tree(s)",
                germ.store_id,
                dir.display(),
                ids.len(),
                germ.version,
                germ.seeds.len()
            );
            germ
        };

        Ok(Arc::new(StoreContext {
            dir: dir.to_path_buf(),
            cache: Mutex::new(PageCache::new(config.page_cache_pages)),
            config,
            zones: RwLock::new(zones),
            retiring: Mutex::new(BTreeMap::new()),
            germ: Mutex::new(germ),
            metrics: Arc::new(StoreMetrics::new()),
        }))
    }

    pub(crate) fn dir(&self) -> &Path {
        &self.dir
    }

    pub(crate) fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub(crate) fn metrics(&self) -> &Arc<StoreMetrics> {
        &self.metrics
    }

    /// Last durable germ.
    pub(crate) fn germ(&self) -> Result<Germ> {
        Ok(self.germ.lock().map_err(|_| anyhow!("germ lock poisoned"))?.clone())
    }

    // ---------------- zones ----------------

    /// Zone receiving new chunks (the newest one).
    pub(crate) fn active_zone(&self) -> Result<Arc<Zone>> {
        let zones = self.zones.read().map_err(|_| anyhow!("zone set poisoned"))?;
        zones
            .values()
            .next_back()
            .cloned()
            .ok_or_else(|| TreeError::State("store has no zones".into()).into())
    }

    pub(crate) fn zone_by_id(&self, id: u32) -> Result<Option<Arc<Zone>>> {
        let zones = self.zones.read().map_err(|_| anyhow!("zone set poisoned"))?;
        Ok(zones.get(&id).cloned())
    }

    pub(crate) fn zones(&self) -> Result<Vec<Arc<Zone>>> {
        let zones = self.zones.read().map_err(|_| anyhow!("zone set poisoned"))?;
        Ok(zones.values().cloned().collect())
    }

    /// Register an existing zone file that is not part of the zone set yet.
    pub(crate) fn open_zone(&self, id: u32) -> Result<Arc<Zone>> {
        let mut zones = self.zones.write().map_err(|_| anyhow!("zone set poisoned"))?;
        if let Some(z) = zones.get(&id) {
            return Ok(z.clone());
        }
        let zone = Arc::new(Zone::open(&self.dir, id)?);
        zones.insert(id, zone.clone());
        Ok(zone)
    }

    /// Bytes of chunks across all zones.
    pub(crate) fn zone_bytes(&self) -> Result<u64> {
        Ok(self
            .zones()?
            .iter()
            .map(|z| z.size().saturating_sub(ZONE_HEAD_SIZE))
            .sum())
    }

    /// Start the next zone, carrying the current germ. Caller holds the
    /// commit lock.
    pub(crate) fn shift_zone(&self) -> Result<Arc<Zone>> {
        let germ = self.germ()?;
        let mut zones = self.zones.write().map_err(|_| anyhow!("zone set poisoned"))?;
        let id = zones.keys().next_back().map(|id| id + 1).unwrap_or(0);
        let zone = Arc::new(Zone::create(&self.dir, id, &germ, self.config.data_fsync)?);
        zones.insert(id, zone.clone());
        self.metrics.record_zone_shift();
        info!("shifted to zone {} at version {}", id, germ.version);
        Ok(zone)
    }

    /// Zone `id` for reading: live, or retired but not removed yet.
    pub(crate) fn readable_zone(&self, id: u32) -> Result<Option<Arc<Zone>>> {
        if let Some(z) = self.zone_by_id(id)? {
            return Ok(Some(z));
        }
        let retiring = self.retiring.lock().map_err(|_| anyhow!("retiring set poisoned"))?;
        Ok(retiring.get(&id).cloned())
    }

    /// Ids of retired zones whose files are still on disk.
    pub(crate) fn retiring_zones(&self) -> Vec<u32> {
        self.retiring
            .lock()
            .map(|r| r.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Take `id` out of the zone set. Readers holding older roots can still
    /// load its pages until the delete delay has passed; then its cache
    /// entries are evicted and the file removed.
    pub(crate) fn retire_zone(self: &Arc<Self>, id: u32) -> Result<()> {
        let zone = {
            let mut zones = self.zones.write().map_err(|_| anyhow!("zone set poisoned"))?;
            if zones.keys().next_back() == Some(&id) {
                return Err(TreeError::State(format!("cannot retire active zone {}", id)).into());
            }
            zones.remove(&id)
        };
        let zone = match zone {
            Some(z) => z,
            None => return Ok(()),
        };
        self.metrics.record_zone_retired();
        let delay = self.config.delete_delay();
        if delay.is_zero() {
            info!("retired zone {}", id);
            return self.remove_retired(&zone);
        }
        self.retiring
            .lock()
            .map_err(|_| anyhow!("retiring set poisoned"))?
            .insert(id, zone.clone());
        info!("retired zone {}; removal in {} ms", id, delay.as_millis());
        schedule_removal(Arc::downgrade(self), zone, delay);
        Ok(())
    }

    fn remove_retired(&self, zone: &Zone) -> Result<()> {
        let id = zone.id();
        if let Ok(mut r) = self.retiring.lock() {
            r.remove(&id);
        }
        let evicted = match self.cache.lock() {
            Ok(mut c) => c.evict_zone(id),
            Err(_) => 0,
        };
        debug!("removing zone {} ({} cached pages evicted)", id, evicted);
        zone.remove_file()
    }

    // ---------------- commit support ----------------

    /// Make `germ` durable in `zone` and remember it as current.
    pub(crate) fn publish_germ(&self, zone: &Zone, germ: Germ) -> Result<()> {
        zone.write_germ(&germ, self.config.data_fsync)?;
        let mut cur = self.germ.lock().map_err(|_| anyhow!("germ lock poisoned"))?;
        *cur = germ;
        Ok(())
    }

    /// Seed the cache with pages a commit just wrote.
    pub(crate) fn warm(&self, pages: Vec<(PageAddr, CachedPage)>) {
        if let Ok(mut c) = self.cache.lock() {
            for (addr, page) in pages {
                c.put((addr.zone, addr.offset), page);
            }
        }
    }

    pub(crate) fn cached_pages(&self) -> usize {
        self.cache.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub(crate) fn clear_cache(&self) {
        if let Ok(mut c) = self.cache.lock() {
            c.clear();
        }
    }

    pub(crate) fn hit_ratio(&self) -> f64 {
        self.metrics.snapshot().cache_hit_ratio()
    }
}

fn schedule_removal(ctx: Weak<StoreContext>, zone: Arc<Zone>, delay: Duration) {
    let remove = move |ctx: Weak<StoreContext>, zone: Arc<Zone>| {
        let r = match ctx.upgrade() {
            Some(ctx) => ctx.remove_retired(&zone),
            None => zone.remove_file(),
        };
        if let Err(e) = r {
            warn!("removing retired zone {}: {:#}", zone.id(), e);
        }
    };
    let spawned = thread::Builder::new()
        .name(format!("canopy-retire-{}", zone.id()))
        .spawn({
            let (ctx, zone) = (ctx.clone(), zone.clone());
            move || {
                thread::sleep(delay);
                remove(ctx, zone);
            }
        });
    if let Err(e) = spawned {
        warn!("cannot schedule removal of zone {} ({}); removing now", zone.id(), e);
        remove(ctx, zone);
    }
}

impl PageLoader for StoreContext {
    fn load_page(&self, addr: &PageAddr) -> Result<CachedPage> {
        let key = (addr.zone, addr.offset);
        if let Some(page) = self
            .cache
            .lock()
            .map_err(|_| anyhow!("page cache poisoned"))?
            .get(key)
        {
            self.metrics.record_cache_hit();
            return Ok(page);
        }
        self.metrics.record_cache_miss();

        let zone = self.readable_zone(addr.zone)?.ok_or_else(|| TreeError::CorruptBlock {
            zone: addr.zone,
            offset: addr.offset,
            reason: "zone is not part of the store".into(),
        })?;
        let block = zone.read_at(addr.offset, addr.size as usize)?;
        let page = decode_block(addr.zone, addr.offset, &block)?;
        debug!(
            "loaded page zone={} offset={} size={} version={}",
            addr.zone,
            addr.offset,
            addr.size,
            page.version()
        );
        if let Ok(mut c) = self.cache.lock() {
            c.put(key, page.clone());
        }
        Ok(page)
    }
}
