//! Tag and repository naming conventions
//!
//! Every record stevedore keeps in a backend is an image whose name encodes
//! the record key. These encodings are a wire format shared with every other
//! writer of the same repository, so they must stay stable and bijective.

use crate::error::{StevedoreError, StevedoreResult};
use crate::stage::ClientIdRecord;
use std::collections::HashMap;
use tracing::debug;

/// Reserved tag standing in for the empty image name
pub const NAMELESS_IMAGE_RECORD_TAG: &str = "__nameless__";

/// Local runtime repository holding stage images, one per project
pub const LOCAL_STAGES_REPO_PREFIX: &str = "stevedore-stages-storage";
/// Local runtime repository holding managed-image markers
pub const LOCAL_MANAGED_IMAGES_REPO_PREFIX: &str = "stevedore-managed-images";
/// Local runtime repository holding commit metadata markers
pub const LOCAL_IMAGES_METADATA_REPO_PREFIX: &str = "stevedore-images-metadata-by-commit";
/// Local runtime repository holding client id markers
pub const LOCAL_CLIENT_ID_REPO_PREFIX: &str = "stevedore-client-id";

/// Registry tag prefix of managed-image markers
pub const REPO_MANAGED_IMAGE_TAG_PREFIX: &str = "managed-image-";
/// Registry tag prefix of commit metadata markers
pub const REPO_IMAGE_METADATA_TAG_PREFIX: &str = "meta-";
/// Registry tag prefix of client id markers
pub const REPO_CLIENT_ID_TAG_PREFIX: &str = "client-id-";

const SLASH_ESCAPE: &str = "__slash__";
const PLUS_ESCAPE: &str = "__plus__";

/// `imageName -> stageID -> [commits]`
pub type ImageMetadataGroups = HashMap<String, HashMap<String, Vec<String>>>;

/// Stage tag `<digest>-<uniqueID>`
pub fn stage_tag(digest: &str, unique_id: i64) -> String {
    format!("{}-{}", digest, unique_id)
}

/// Decode a stage tag back into `(digest, uniqueID)`.
///
/// A tag without any separator is malformed. A tag whose suffix is not a
/// number is reported as an unexpected tag format, which callers may skip.
pub fn parse_stage_tag(tag: &str) -> StevedoreResult<(String, i64)> {
    let (digest, unique_id) = tag
        .split_once('-')
        .ok_or_else(|| StevedoreError::MalformedStageTag(tag.to_string()))?;

    let unique_id = unique_id.parse::<i64>().map_err(|e| {
        StevedoreError::unexpected_tag(
            tag,
            format!("unable to parse unique id {} as timestamp: {}", unique_id, e),
        )
    })?;

    Ok((digest.to_string(), unique_id))
}

/// Escape an image name so it fits a single tag segment
pub fn slug_image_name(image_name: &str) -> String {
    if image_name.is_empty() {
        return NAMELESS_IMAGE_RECORD_TAG.to_string();
    }
    image_name
        .replace('/', SLASH_ESCAPE)
        .replace('+', PLUS_ESCAPE)
}

/// Reverse of [`slug_image_name`]
pub fn unslug_image_name(tag: &str) -> String {
    if tag == NAMELESS_IMAGE_RECORD_TAG {
        return String::new();
    }
    tag.replace(SLASH_ESCAPE, "/").replace(PLUS_ESCAPE, "+")
}

/// Tags are lower-case only, upper-case image names cannot be recorded
pub fn validate_image_name(image_name: &str) -> StevedoreResult<()> {
    if image_name.to_lowercase() != image_name {
        return Err(StevedoreError::User(format!(
            "invalid image name {:?}: no upcase symbols allowed",
            image_name
        )));
    }
    Ok(())
}

/// Stable identifier of an image name that fits in one tag segment
pub fn image_name_id(image_name: &str) -> String {
    format!("{:x}", murmur3_32(image_name.as_bytes(), 0))
}

/// Commit metadata tag body `<imageID>_<commit>_<stageID>`
pub fn image_metadata_tag(image_id: &str, commit: &str, stage_id: &str) -> String {
    format!("{}_{}_{}", image_id, commit, stage_id)
}

/// Client id tag body `<clientID>-<timestamp>`
pub fn client_id_tag(record: &ClientIdRecord) -> String {
    format!("{}-{}", record.client_id, record.timestamp_millisec)
}

/// Decode a client id tag body.
///
/// The client id may itself contain `-`, so the token is reversed, split once
/// from what was its end, and both parts are reversed back. This holds as long
/// as the numeric timestamp never contains the separator.
pub fn parse_client_id_tag(tag: &str) -> Option<ClientIdRecord> {
    let reversed: String = tag.chars().rev().collect();
    let (timestamp, client_id) = reversed.split_once('-')?;

    let timestamp: String = timestamp.chars().rev().collect();
    let client_id: String = client_id.chars().rev().collect();

    let timestamp_millisec = timestamp.parse::<i64>().ok()?;
    Some(ClientIdRecord {
        client_id,
        timestamp_millisec,
    })
}

/// Group commit metadata tags by image name.
///
/// Returns the entries whose image id resolves to one of `image_names`, and
/// separately the entries with unknown ids, keyed by the raw id.
pub fn group_image_metadata_tags(
    image_names: &[String],
    tags: &[String],
    tag_prefix: &str,
) -> (ImageMetadataGroups, ImageMetadataGroups) {
    let names_by_id: HashMap<String, &String> = image_names
        .iter()
        .map(|name| (image_name_id(name), name))
        .collect();

    let mut managed = ImageMetadataGroups::new();
    let mut foreign = ImageMetadataGroups::new();

    for tag in tags {
        let Some(body) = tag.strip_prefix(tag_prefix) else {
            continue;
        };

        let parts: Vec<&str> = body.split('_').collect();
        let [image_id, commit, stage_id] = parts[..] else {
            continue;
        };

        debug!(
            "Found image ID {} commit {} stage ID {}",
            image_id, commit, stage_id
        );

        let (groups, image_name) = match names_by_id.get(image_id) {
            Some(name) => (&mut managed, (*name).clone()),
            None => (&mut foreign, image_id.to_string()),
        };

        groups
            .entry(image_name)
            .or_default()
            .entry(stage_id.to_string())
            .or_default()
            .push(commit.to_string());
    }

    (managed, foreign)
}

/// MurmurHash3, x86 32-bit variant
fn murmur3_32(data: &[u8], seed: u32) -> u32 {
    const C1: u32 = 0xcc9e_2d51;
    const C2: u32 = 0x1b87_3593;

    let mut h = seed;
    let mut chunks = data.chunks_exact(4);

    for chunk in &mut chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        h ^= k;
        h = h.rotate_left(13).wrapping_mul(5).wrapping_add(0xe654_6b64);
    }

    let tail = chunks.remainder();
    if !tail.is_empty() {
        let mut k: u32 = 0;
        for (i, byte) in tail.iter().enumerate() {
            k |= u32::from(*byte) << (8 * i);
        }
        k = k.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        h ^= k;
    }

    h ^= data.len() as u32;
    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^= h >> 16;
    h
}
