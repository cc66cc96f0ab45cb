//! Derives per-image strip counts.
//!
//! This must match the site's own reader exactly, since the strip count
//! decides the geometry used to reassemble each image.

/// Chapters below this id were all cut into the same number of strips.
pub const LEGACY_BOUNDARY: u64 = 268_850;

/// Chapters from this id onwards use the smaller modulus.
pub const NARROW_BOUNDARY: u64 = 421_926;

const LEGACY_STRIPS: u32 = 10;

/// Returns the strip count of one image, `0` meaning "not scrambled".
///
/// `image_name` is the file name without its extension, e.g. `"00001"`.
pub fn split_count(page_id: u64, threshold: u64, image_name: &str) -> u32 {
    if page_id < threshold {
        return 0;
    }

    if page_id < LEGACY_BOUNDARY {
        return LEGACY_STRIPS;
    }

    let modulus: u32 = if page_id < NARROW_BOUNDARY { 10 } else { 8 };
    let digest = format!("{:x}", md5::compute(format!("{page_id}{image_name}")));

    // ord() of the last hex character, not its numeric value
    let last = u32::from(digest.as_bytes()[digest.len() - 1]);

    (last % modulus) * 2 + 2
}

/// Strip counts for every image of a chapter, in the same order as `image_names`.
pub fn derive_split_counts<S: AsRef<str>>(page_id: u64, threshold: u64, image_names: &[S]) -> Vec<u32> {
    image_names
        .iter()
        .map(|name| split_count(page_id, threshold, name.as_ref()))
        .collect()
}
