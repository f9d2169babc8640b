//! Audio tag embedding for materialized PMOMusic artifacts.
//!
//! Reads and writes the handful of tag fields PMOMusic cares about
//! (title/artist/album/lyrics/cover) across the container formats produced
//! by resolvers and fallback scripts: MP3 (ID3v2) and FLAC (Vorbis
//! comments + picture block). Both are handled through `lofty`'s generic
//! [`Tag`] abstraction, which maps the same [`ItemKey`] onto the
//! format-appropriate frame/field names.

use lofty::config::{ParseOptions, WriteOptions};
use lofty::picture::{MimeType, Picture, PictureType};
use lofty::prelude::*;
use lofty::probe::Probe;
use lofty::tag::Tag;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("unsupported or undetected audio container")]
    UnsupportedContainer,
    #[error("lofty error: {0}")]
    Lofty(#[from] lofty::error::LoftyError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cover image error: {0}")]
    Image(#[from] image::ImageError),
}

pub type Result<T> = std::result::Result<T, MetadataError>;

/// The subset of a cached `InfoEntry` relevant to tag embedding.
#[derive(Debug, Clone, Default)]
pub struct SongInfo {
    pub name: Option<String>,
    pub singer: Option<String>,
    pub album: Option<String>,
}

/// Everything the embedder might write into a single audio file. Any field
/// left `None` is simply skipped; the embedder never fails for missing
/// inputs.
#[derive(Debug, Clone, Default)]
pub struct EmbedRequest<'a> {
    pub info: Option<&'a SongInfo>,
    pub lyric: Option<&'a str>,
    /// Cover image bytes. Must already be JPEG; use [`ensure_jpeg`] first
    /// if the source bytes might be a different format.
    pub cover_jpeg: Option<&'a [u8]>,
}

/// Decodes and re-encodes arbitrary image bytes to JPEG, unless the input
/// is already JPEG (detected by its leading byte signature, not by file
/// extension, per the embedding contract).
pub fn ensure_jpeg(bytes: &[u8]) -> Result<Vec<u8>> {
    const JPEG_MAGIC: [u8; 3] = [0xFF, 0xD8, 0xFF];
    if bytes.len() >= 3 && bytes[..3] == JPEG_MAGIC {
        return Ok(bytes.to_vec());
    }
    let img = image::load_from_memory(bytes)?;
    let mut out = Vec::new();
    let mut cursor = std::io::Cursor::new(&mut out);
    img.to_rgb8()
        .write_to(&mut cursor, image::ImageFormat::Jpeg)?;
    Ok(out)
}

/// Embeds `request`'s fields into the audio file at `path`, in place.
///
/// A no-op (returns `Ok(())` without touching the file) when `request` has
/// nothing to write, matching the "ensure metadata cached" job's tolerance
/// for partial inputs.
pub fn embed(path: &Path, request: &EmbedRequest<'_>) -> Result<()> {
    if request.info.is_none() && request.lyric.is_none() && request.cover_jpeg.is_none() {
        return Ok(());
    }

    let mut tagged_file = Probe::open(path)?.options(ParseOptions::new()).read()?;

    let tag = match tagged_file.primary_tag_mut() {
        Some(tag) => tag,
        None => {
            let tag_type = tagged_file.file_type().primary_tag_type();
            tagged_file.insert_tag(Tag::new(tag_type));
            tagged_file
                .primary_tag_mut()
                .expect("tag was just inserted")
        }
    };

    if let Some(info) = request.info {
        if let Some(name) = &info.name {
            tag.insert_text(ItemKey::TrackTitle, name.clone());
        }
        if let Some(singer) = &info.singer {
            tag.insert_text(ItemKey::TrackArtist, singer.clone());
        }
        if let Some(album) = &info.album {
            tag.insert_text(ItemKey::AlbumTitle, album.clone());
        }
    }

    if let Some(lyric) = request.lyric {
        tag.insert_text(ItemKey::Lyrics, lyric.to_string());
    }

    if let Some(cover) = request.cover_jpeg {
        tag.remove_picture_type(PictureType::CoverFront);
        tag.push_picture(Picture::new_unchecked(
            PictureType::CoverFront,
            Some(MimeType::Jpeg),
            None,
            cover.to_vec(),
        ));
    }

    tagged_file.save_to_path(path, WriteOptions::default())?;
    Ok(())
}

/// Lightweight read-only view used for diagnostics and tests; not part of
/// the embedding path itself.
pub fn read_title(path: &Path) -> Result<Option<String>> {
    let tagged_file = Probe::open(path)?.options(ParseOptions::new()).read()?;
    let tag = tagged_file.primary_tag().or_else(|| tagged_file.first_tag());
    Ok(tag.and_then(|t| t.title().map(|s| s.to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jpeg_bytes_pass_through_unchanged() {
        let jpeg = [0xFFu8, 0xD8, 0xFF, 0xE0, 0x00];
        let out = ensure_jpeg(&jpeg).unwrap();
        assert_eq!(out, jpeg);
    }

    #[test]
    fn png_bytes_are_reencoded_to_jpeg() {
        let mut png_bytes = Vec::new();
        let img = image::RgbImage::from_pixel(4, 4, image::Rgb([10, 20, 30]));
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut std::io::Cursor::new(&mut png_bytes), image::ImageFormat::Png)
            .unwrap();
        let out = ensure_jpeg(&png_bytes).unwrap();
        assert_eq!(&out[..3], &[0xFF, 0xD8, 0xFF]);
    }

    #[test]
    fn embed_with_nothing_set_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.mp3");
        let request = EmbedRequest::default();
        embed(&path, &request).unwrap();
    }
}
