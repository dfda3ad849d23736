//! Strategies that turn a set of images into grouping proposals.
//!
//! Every strategy is pure and deterministic for a given input order, and
//! none of them touches the project: proposals only become groups when
//! confirmed.

use crate::core::hash;
use crate::core::profile::{self, VisualProfile};
use crate::models::{GroupingProposal, ImageSource};
use std::collections::HashMap;

pub const DEFAULT_PHASH_THRESHOLD: f64 = 0.85;
pub const DEFAULT_PROFILE_THRESHOLD: f64 = 0.8;

const IMAGE_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "tif", "tiff"];

/// Lower-cased label with a known image extension and trailing sequence
/// number removed: `Page_01.JPG` → `page`.
pub fn filename_stem(label: &str) -> String {
    let lower = label.to_lowercase();

    let without_extension = match lower.rsplit_once('.') {
        Some((stem, extension)) if IMAGE_EXTENSIONS.contains(&extension) => stem,
        _ => lower.as_str(),
    };

    let without_digits = without_extension.trim_end_matches(|c: char| c.is_ascii_digit());
    if without_digits.len() == without_extension.len() {
        return without_extension.to_string();
    }

    without_digits
        .strip_suffix(['_', '-'])
        .unwrap_or(without_digits)
        .to_string()
}

/// Everything before the last `/` segment of a structural path, or `None`
/// when the path has fewer than two non-empty segments.
pub fn leaf_folder(structural_path: &str) -> Option<String> {
    let segments: Vec<&str> = structural_path
        .split('/')
        .filter(|segment| !segment.is_empty())
        .collect();
    if segments.len() < 2 {
        return None;
    }
    Some(segments[..segments.len() - 1].join("/"))
}

pub fn group_by_filename(images: &[ImageSource]) -> Vec<GroupingProposal> {
    bucket(images, |image| image.label.as_deref().map(filename_stem))
        .into_iter()
        .filter(|(_, ids)| ids.len() > 1)
        .map(|(stem, ids)| GroupingProposal::new(ids, format!("Filename stem: {}", stem)))
        .collect()
}

pub fn group_by_leaf_folder(images: &[ImageSource]) -> Vec<GroupingProposal> {
    bucket(images, |image| image.structural_path.as_deref().and_then(leaf_folder))
        .into_iter()
        .filter(|(_, ids)| ids.len() > 1)
        .map(|(folder, ids)| GroupingProposal::new(ids, format!("Leaf folder: {}", folder)))
        .collect()
}

/// Greedy clustering on perceptual-hash similarity. Images without a hash
/// are skipped.
pub fn group_by_perceptual_hash(images: &[ImageSource], threshold: f64) -> Vec<GroupingProposal> {
    let keyed: Vec<(&str, &str)> = images
        .iter()
        .filter_map(|image| {
            image
                .hashes
                .perceptual_hash
                .as_deref()
                .map(|hash| (image.id.as_str(), hash))
        })
        .collect();

    greedy_cluster(&keyed, |a, b| hash::similarity(a, b), threshold)
        .into_iter()
        .map(|ids| {
            GroupingProposal::new(ids, format!("pHash ≥ {}%", percent(threshold)))
                .with_confidence(threshold)
        })
        .collect()
}

/// Greedy clustering on colour-profile cosine similarity. Images without a
/// profile are skipped.
pub fn group_by_visual_profile(
    images: &[ImageSource],
    profiles: &HashMap<String, VisualProfile>,
    threshold: f64,
) -> Vec<GroupingProposal> {
    let keyed: Vec<(&str, &[f64])> = images
        .iter()
        .filter_map(|image| {
            profiles
                .get(&image.id)
                .map(|profile| (image.id.as_str(), profile.as_slice()))
        })
        .collect();

    greedy_cluster(&keyed, |a, b| profile::cosine_similarity(a, b), threshold)
        .into_iter()
        .map(|ids| GroupingProposal::new(ids, format!("Visual profile ≥ {}%", percent(threshold))))
        .collect()
}

/// One singleton proposal per image.
pub fn group_individually(images: &[ImageSource]) -> Vec<GroupingProposal> {
    images
        .iter()
        .map(|image| {
            let label = image.label.as_deref().unwrap_or("Unnamed");
            GroupingProposal::new(vec![image.id.clone()], format!("Individual: {}", label))
                .with_confidence(1.0)
        })
        .collect()
}

fn percent(threshold: f64) -> i64 {
    (threshold * 100.0).round() as i64
}

// Buckets image ids by key, keeping buckets in first-seen order.
fn bucket<F>(images: &[ImageSource], key: F) -> Vec<(String, Vec<String>)>
where
    F: Fn(&ImageSource) -> Option<String>,
{
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut buckets: Vec<(String, Vec<String>)> = Vec::new();

    for image in images {
        let Some(name) = key(image) else { continue };
        match index.get(&name) {
            Some(&position) => buckets[position].1.push(image.id.clone()),
            None => {
                index.insert(name.clone(), buckets.len());
                buckets.push((name, vec![image.id.clone()]));
            }
        }
    }
    buckets
}

// Seeds a cluster at each unclaimed item in order and claims every later
// unclaimed item at or above the threshold. Only clusters of two or more are
// returned.
fn greedy_cluster<K: ?Sized, F>(items: &[(&str, &K)], similarity: F, threshold: f64) -> Vec<Vec<String>>
where
    F: Fn(&K, &K) -> f64,
{
    let mut claimed = vec![false; items.len()];
    let mut clusters = Vec::new();

    for i in 0..items.len() {
        if claimed[i] {
            continue;
        }
        let (seed_id, seed_key) = items[i];
        let mut cluster = vec![seed_id.to_string()];

        for j in (i + 1)..items.len() {
            if claimed[j] {
                continue;
            }
            let (id, key) = items[j];
            if similarity(seed_key, key) >= threshold {
                cluster.push(id.to_string());
                claimed[j] = true;
            }
        }

        if cluster.len() > 1 {
            claimed[i] = true;
            clusters.push(cluster);
        }
    }

    clusters
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Dimensions;

    fn image(id: &str, label: Option<&str>, path: Option<&str>, phash: Option<&str>) -> ImageSource {
        let mut image = ImageSource::ingested(
            format!("hash_{}", id),
            Dimensions {
                width: 10,
                height: 10,
            },
            label.map(String::from),
            path.map(String::from),
        );
        image.id = id.to_string();
        image.hashes.perceptual_hash = phash.map(String::from);
        image
    }

    #[test]
    fn test_filename_stem() {
        assert_eq!(filename_stem("page01.jpg"), "page");
        assert_eq!(filename_stem("Page_02.JPEG"), "page");
        assert_eq!(filename_stem("folio-12r.tif"), "folio-12r");
        assert_eq!(filename_stem("cover.png"), "cover");
        assert_eq!(filename_stem("scan_7"), "scan");
        assert_eq!(filename_stem("notes.txt"), "notes.txt");
        assert_eq!(filename_stem("archive.v2.tiff"), "archive.v");
    }

    #[test]
    fn test_group_by_filename() {
        let images = vec![
            image("a", Some("page01.jpg"), None, None),
            image("b", Some("page02.jpg"), None, None),
            image("c", Some("cover.jpg"), None, None),
            image("d", None, None, None),
        ];

        let proposals = group_by_filename(&images);
        assert_eq!(proposals.len(), 1);
        assert_eq!(proposals[0].image_ids, vec!["a", "b"]);
        assert_eq!(proposals[0].reason.as_deref(), Some("Filename stem: page"));
    }

    #[test]
    fn test_group_by_leaf_folder() {
        let images = vec![
            image("a", None, Some("box1/ms12/f1r.jpg"), None),
            image("b", None, Some("/box1/ms12/f1v.jpg"), None),
            image("c", None, Some("loose.jpg"), None),
            image("d", None, Some("box2/f1r.jpg"), None),
        ];

        let proposals = group_by_leaf_folder(&images);
        assert_eq!(proposals.len(), 1);
        assert_eq!(proposals[0].image_ids, vec!["a", "b"]);
        assert_eq!(proposals[0].reason.as_deref(), Some("Leaf folder: box1/ms12"));
        assert_eq!(leaf_folder("loose.jpg"), None);
    }

    #[test]
    fn test_group_by_perceptual_hash() {
        let images = vec![
            image("a", None, None, Some("0000000000000000")),
            image("b", None, None, Some("0000000000000001")),
            image("c", None, None, Some("ffffffffffffffff")),
            image("d", None, None, None),
            image("e", None, None, Some("fffffffffffffff0")),
        ];

        let proposals = group_by_perceptual_hash(&images, DEFAULT_PHASH_THRESHOLD);
        assert_eq!(proposals.len(), 2);
        assert_eq!(proposals[0].image_ids, vec!["a", "b"]);
        assert_eq!(proposals[1].image_ids, vec!["c", "e"]);
        assert_eq!(proposals[0].reason.as_deref(), Some("pHash ≥ 85%"));
        assert_eq!(proposals[0].confidence, Some(0.85));
    }

    #[test]
    fn test_greedy_is_seed_based() {
        // b is close to both a and c, but a and c are far apart. The seed a
        // claims b, leaving c alone.
        let items = [("a", &0.0f64), ("b", &0.5), ("c", &1.0)];
        let clusters = greedy_cluster(&items, |x: &f64, y: &f64| 1.0 - (x - y).abs(), 0.5);
        assert_eq!(clusters, vec![vec!["a".to_string(), "b".to_string()]]);
    }

    #[test]
    fn test_group_by_visual_profile() {
        let images = vec![
            image("a", None, None, None),
            image("b", None, None, None),
            image("c", None, None, None),
        ];
        let profiles = HashMap::from([
            ("a".to_string(), vec![0.5, 0.5, 0.0]),
            ("b".to_string(), vec![0.45, 0.55, 0.0]),
            ("c".to_string(), vec![0.0, 0.0, 1.0]),
        ]);

        let proposals = group_by_visual_profile(&images, &profiles, DEFAULT_PROFILE_THRESHOLD);
        assert_eq!(proposals.len(), 1);
        assert_eq!(proposals[0].image_ids, vec!["a", "b"]);
        assert_eq!(proposals[0].reason.as_deref(), Some("Visual profile ≥ 80%"));
    }

    #[test]
    fn test_group_individually() {
        let images = vec![image("a", Some("cover.jpg"), None, None), image("b", None, None, None)];
        let proposals = group_individually(&images);
        assert_eq!(proposals.len(), 2);
        assert_eq!(proposals[1].reason.as_deref(), Some("Individual: Unnamed"));
    }
}
