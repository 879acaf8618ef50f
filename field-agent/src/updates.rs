//! Product update detection.
//!
//! Each product the archive distributes lives under a known directory with
//! known extensions. Comparing the product's slice of the archive manifest
//! with the mirror's slice tells whether the field host is behind.

use crate::manifest::hash::hash_bytes;
use crate::manifest::{FileRecord, Manifest};
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductKind {
    NavDatabase,
    HxrSoftware,
    MiniApSoftware,
    AhrsSoftware,
    ServoSoftware,
}

struct ProductLayout {
    kind: ProductKind,
    label: &'static str,
    directory: &'static str,
    extensions: &'static [&'static str],
}

const PRODUCTS: &[ProductLayout] = &[
    ProductLayout {
        kind: ProductKind::NavDatabase,
        label: "Navigation database",
        directory: "navdata",
        extensions: &["db", "dat", "zip"],
    },
    ProductLayout {
        kind: ProductKind::HxrSoftware,
        label: "HXr software",
        directory: "software/hxr",
        extensions: &["dat"],
    },
    ProductLayout {
        kind: ProductKind::MiniApSoftware,
        label: "Mini AP software",
        directory: "software/mini-ap",
        extensions: &["dat"],
    },
    ProductLayout {
        kind: ProductKind::AhrsSoftware,
        label: "Mini AHRS software",
        directory: "software/mini-ahrs",
        extensions: &["dat"],
    },
    ProductLayout {
        kind: ProductKind::ServoSoftware,
        label: "Servo software",
        directory: "software/servo",
        extensions: &["dat"],
    },
];

impl ProductKind {
    pub const ALL: [ProductKind; 5] = [
        ProductKind::NavDatabase,
        ProductKind::HxrSoftware,
        ProductKind::MiniApSoftware,
        ProductKind::AhrsSoftware,
        ProductKind::ServoSoftware,
    ];

    fn layout(self) -> &'static ProductLayout {
        // Every variant has exactly one entry in PRODUCTS.
        PRODUCTS
            .iter()
            .find(|p| p.kind == self)
            .unwrap_or(&PRODUCTS[0])
    }

    pub fn directory(self) -> &'static str {
        self.layout().directory
    }

    /// Whether a manifest path belongs to this product.
    pub fn owns(self, path: &str) -> bool {
        let layout = self.layout();
        let Some(rest) = path.strip_prefix(layout.directory) else {
            return false;
        };
        if !rest.starts_with('/') {
            return false;
        }
        let extension = match rest.rsplit_once('.') {
            Some((_, ext)) => ext.to_ascii_lowercase(),
            None => return false,
        };
        layout.extensions.contains(&extension.as_str())
    }

    /// Compare the mirror against the archive for this product.
    pub fn check_for_update(self, mirror: &Manifest, archive: &Manifest) -> UpdateInfo {
        let current = self.records(mirror);
        let available = self.records(archive);

        let mut stale_files = Vec::new();
        let mut download_bytes: u64 = 0;
        for record in &available {
            let up_to_date = mirror
                .get(&record.path)
                .is_some_and(|local| local.checksum == record.checksum);
            if !up_to_date {
                stale_files.push(record.path.clone());
                download_bytes = download_bytes.saturating_add(record.size);
            }
        }

        UpdateInfo {
            kind: self,
            current_version: fingerprint(&current),
            available_version: fingerprint(&available),
            stale_files,
            download_bytes,
        }
    }

    fn records<'a>(self, manifest: &'a Manifest) -> Vec<&'a FileRecord> {
        manifest.records().filter(|r| self.owns(&r.path)).collect()
    }
}

impl fmt::Display for ProductKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.layout().label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpdateInfo {
    pub kind: ProductKind,
    /// Content fingerprint of the mirrored files; `None` when none exist.
    pub current_version: Option<String>,
    pub available_version: Option<String>,
    /// Archive files missing or different on the mirror.
    pub stale_files: Vec<String>,
    pub download_bytes: u64,
}

impl UpdateInfo {
    pub fn has_update(&self) -> bool {
        self.available_version.is_some() && self.current_version != self.available_version
    }
}

/// The product a manifest path belongs to, if any.
pub fn product_for(path: &str) -> Option<ProductKind> {
    ProductKind::ALL.into_iter().find(|kind| kind.owns(path))
}

/// Check every product; only products with an update are returned.
pub fn check_all(mirror: &Manifest, archive: &Manifest) -> Vec<UpdateInfo> {
    ProductKind::ALL
        .iter()
        .map(|kind| kind.check_for_update(mirror, archive))
        .filter(UpdateInfo::has_update)
        .collect()
}

/// Short digest over the (path, checksum) pairs, in path order.
fn fingerprint(records: &[&FileRecord]) -> Option<String> {
    if records.is_empty() {
        return None;
    }
    let mut joined = String::new();
    for record in records {
        joined.push_str(&record.path);
        joined.push('\0');
        joined.push_str(&record.checksum);
        joined.push('\n');
    }
    let digest = hash_bytes(joined.as_bytes());
    Some(digest[..12].to_string())
}
