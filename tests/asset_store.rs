use std::sync::Arc;

use image::{Rgba, RgbaImage};

use tokenstudio::assets::{
    AssetFilter, AssetStore, AssetType, BlobUrlRegistry, DiskBackend, IndexPath, MemoryBackend, NewAsset,
    SaveOptions, Scope, SortKey,
};
use tokenstudio::io;

/// Noisy 56×56 PNG, around 10 KB.
fn noisy_png(seed: u32) -> Vec<u8> {
    let mut state = seed.wrapping_mul(2_654_435_761).wrapping_add(1);
    let img = RgbaImage::from_fn(56, 56, |_, _| {
        state ^= state << 13;
        state ^= state >> 17;
        state ^= state << 5;
        let b = state.to_le_bytes();
        Rgba([b[0], b[1], b[2], 255])
    });
    io::encode_png(&img).expect("encode")
}

fn memory_store() -> (Arc<BlobUrlRegistry>, AssetStore) {
    let registry = Arc::new(BlobUrlRegistry::new());
    let store = AssetStore::new(Box::new(MemoryBackend::new()), registry.clone());
    (registry, store)
}

#[test]
fn identical_payloads_share_one_record() {
    let (_, mut store) = memory_store();
    let png = noisy_png(7);
    assert!(png.len() > 8 * 1024);

    let first = store
        .save(NewAsset::new(AssetType::Icon, "sword.png", png.clone()).linked_to("hero"), SaveOptions::default())
        .expect("first save");
    let second = store
        .save(NewAsset::new(AssetType::Icon, "sword-copy.png", png).linked_to("rogue"), SaveOptions::default())
        .expect("second save");

    assert_eq!(first, second);
    assert_eq!(store.len(), 1);
    let info = store.info(first).expect("info");
    assert!(info.linked_to.contains("hero"));
    assert!(info.linked_to.contains("rogue"));
    assert_eq!((info.metadata.width, info.metadata.height), (Some(56), Some(56)));
}

#[test]
fn url_revoked_after_matching_releases() {
    let (registry, mut store) = memory_store();
    let id = store
        .save(NewAsset::new(AssetType::Icon, "a.png", noisy_png(1)), SaveOptions::default())
        .expect("save");

    let urls: Vec<String> = (0..3).map(|_| store.get_asset_url(id).expect("url")).collect();
    assert!(urls.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(registry.minted(), 1);

    assert!(!store.release_url(id));
    assert!(!store.release_url(id));
    assert!(registry.is_live(&urls[0]));
    assert!(store.release_url(id));
    assert!(!registry.is_live(&urls[0]));
    assert_eq!(registry.revoked(), 1);
}

#[test]
fn tracked_url_revoked_when_consumer_is_dropped() {
    let (registry, mut store) = memory_store();
    let id = store
        .save(NewAsset::new(AssetType::Background, "bg.png", noisy_png(2)), SaveOptions::default())
        .expect("save");

    struct TokenCard;
    let card = Arc::new(TokenCard);
    let url = store.get_thumbnail_url_tracked(id, &card).expect("url");
    assert_eq!(store.sweep_urls(), 0);
    assert!(registry.resolve(&url).is_some());

    drop(card);
    assert_eq!(store.sweep_urls(), 1);
    assert!(registry.resolve(&url).is_none());
}

#[test]
fn shutdown_revokes_outstanding_urls() {
    let (registry, mut store) = memory_store();
    for seed in 0..3 {
        let id = store
            .save(NewAsset::new(AssetType::Texture, format!("t{}.png", seed), noisy_png(seed)), SaveOptions::default())
            .expect("save");
        store.get_asset_url(id).expect("url");
    }
    assert_eq!(registry.live_count(), 3);
    store.clear_url_cache();
    assert_eq!(registry.live_count(), 0);
}

#[test]
fn disk_store_persists_across_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let png = noisy_png(3);
    let id = {
        let mut store = AssetStore::open_dir(dir.path()).expect("open");
        let id = store
            .save(NewAsset::new(AssetType::Overlay, "frame.png", png.clone()).in_project("campaign"), SaveOptions::default())
            .expect("save");
        store.link_to_character(id, "npc-1").expect("link");
        store.record_usage(id, Some("campaign")).expect("usage");
        id
    };

    let mut store = AssetStore::open_dir(dir.path()).expect("reopen");
    let record = store.get_by_id(id).expect("record");
    assert_eq!(record.data, png);
    assert!(record.thumbnail.is_some());
    assert!(record.info.linked_to.contains("npc-1"));
    assert_eq!(record.info.usage.usage_count, 1);

    // Dedup still works against the rebuilt index.
    let again = store
        .save(NewAsset::new(AssetType::Overlay, "frame2.png", png), SaveOptions::default())
        .expect("save again");
    assert_eq!(again, id);
}

#[test]
fn index_paths_agree() {
    let dir = tempfile::tempdir().expect("tempdir");
    let backend = DiskBackend::open(dir.path()).expect("open");
    let mut store = AssetStore::new(Box::new(backend), Arc::new(BlobUrlRegistry::new()));
    let kinds = [AssetType::Icon, AssetType::Texture];
    for i in 0..8u32 {
        let mut new = NewAsset::new(kinds[i as usize % 2], format!("asset{}.bin", i), vec![i as u8; 4]);
        if i % 3 == 0 {
            new = new.in_project("p");
        }
        store.save(new, SaveOptions::default()).expect("save");
    }

    let filter = AssetFilter {
        asset_type: Some(AssetType::Icon),
        scope: Some(Scope::Project("p".into())),
        sort: SortKey::Name,
        ..AssetFilter::default()
    };
    let planned = store.list(&filter);
    assert!(!planned.is_empty());
    for path in [IndexPath::TypeAndScope, IndexPath::Type, IndexPath::Scope, IndexPath::FullScan] {
        assert_eq!(store.list_via(path, &filter), planned);
    }
}

#[test]
fn export_streams_project_assets() {
    let (_, mut store) = memory_store();
    for seed in 0..4 {
        let mut new = NewAsset::new(AssetType::Icon, format!("i{}.png", seed), noisy_png(seed + 10));
        if seed % 2 == 0 {
            new = new.in_project("export-me");
        }
        store.save(new, SaveOptions::default()).expect("save");
    }
    let mut stream = store.export_stream(Scope::Project("export-me".into()));
    assert_eq!(stream.size_hint().1, Some(2));
    let first = stream.next().expect("item").expect("record");
    assert!(!first.data.is_empty());
    assert_eq!(stream.count(), 1);
}

#[test]
fn released_tracker_leaves_untracked_holder_alone() {
    let (registry, mut store) = memory_store();
    let id = store
        .save(NewAsset::new(AssetType::Icon, "shield.png", noisy_png(4)), SaveOptions::default())
        .expect("save");

    struct Portrait;
    let portrait = Arc::new(Portrait);
    let tracked = store.get_asset_url_tracked(id, &portrait).expect("tracked url");
    assert!(!store.release_url(id));

    let held = store.get_asset_url(id).expect("untracked url");
    assert_eq!(held, tracked);
    drop(portrait);
    assert_eq!(store.sweep_urls(), 0);
    assert!(registry.is_live(&held));
    assert_eq!(store.urls().ref_count(id), Some(1));

    assert!(store.release_url(id));
    assert!(!registry.is_live(&held));
    assert_eq!(registry.revoked(), 1);
}

#[test]
fn tracked_release_keeps_url_until_consumer_drops() {
    let (registry, mut store) = memory_store();
    let id = store
        .save(NewAsset::new(AssetType::Icon, "helm.png", noisy_png(5)), SaveOptions::default())
        .expect("save");

    struct Portrait;
    let portrait = Arc::new(Portrait);
    let held = store.get_asset_url(id).expect("untracked url");
    store.get_thumbnail_url_tracked(id, &portrait).expect("tracked url");
    assert!(!store.release_url_tracked(id, &portrait));
    assert!(registry.is_live(&held));

    drop(portrait);
    assert_eq!(store.sweep_urls(), 0);
    assert!(store.release_url(id));
    assert_eq!(registry.live_count(), 0);
}
