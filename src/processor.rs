//! Downstream processor contract (§4.6): what the fetcher hands fetched
//! bytes to. This module defines the trait boundary plus one reference,
//! in-process implementation (decode/resize/EXIF + a pluggable persistence
//! sink) suitable for development, testing, and small deployments. A
//! production deployment can swap in an out-of-process consumer of the
//! outbound metadata topic without touching anything upstream of the trait.

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;

use async_trait::async_trait;
use image::imageops::FilterType;
use uuid::Uuid;

use crate::bus::{publish_json, MessageBus};
use crate::error::CrawlError;
use crate::types::{MetadataEvent, Source};

/// Receives fetched bytes for one successfully-downloaded URL. Obligations
/// per §4.6: on decode success, emit dimensions (and optionally EXIF) to the
/// metadata topic and persist a thumbnail keyed by `uuid`; on decode
/// failure, return an error the fetcher maps to `UnidentifiedImageError`.
/// Implementations must be idempotent under re-delivery of the same `uuid`.
#[async_trait]
pub trait DownstreamProcessor: Send + Sync {
    async fn process(&self, uuid: Uuid, source: &Source, buffer: Vec<u8>) -> Result<(), CrawlError>;
}

/// Persists thumbnail bytes keyed by `uuid`. Deliberately narrow so a
/// deployment can point this at a filesystem, object store, or no-op sink
/// without touching the decode/resize/EXIF logic above it.
#[async_trait]
pub trait PersistenceSink: Send + Sync {
    async fn store_thumbnail(&self, uuid: Uuid, bytes: Vec<u8>) -> Result<(), CrawlError>;
}

/// Writes thumbnails to `{root}/{uuid}.png`. Overwriting an existing file
/// on re-delivery is exactly the idempotence §4.6 asks for.
pub struct FilesystemSink {
    root: std::path::PathBuf,
}

impl FilesystemSink {
    pub fn new(root: impl Into<std::path::PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl PersistenceSink for FilesystemSink {
    async fn store_thumbnail(&self, uuid: Uuid, bytes: Vec<u8>) -> Result<(), CrawlError> {
        let path = self.root.join(format!("{uuid}.png"));
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| CrawlError::Decode(format!("thumbnail sink io error: {e}")))?;
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| CrawlError::Decode(format!("thumbnail sink io error: {e}")))
    }
}

/// Reference `DownstreamProcessor`: decodes the buffer with the `image`
/// crate, resizes to a bounding box with nearest-neighbour sampling,
/// attempts EXIF extraction, persists the thumbnail, and publishes
/// dimensions (and EXIF, if present) to the outbound metadata topic.
pub struct ImageThumbnailProcessor {
    bus: Arc<dyn MessageBus>,
    metadata_topic: String,
    sink: Arc<dyn PersistenceSink>,
    target_width: u32,
    target_height: u32,
}

impl ImageThumbnailProcessor {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        metadata_topic: impl Into<String>,
        sink: Arc<dyn PersistenceSink>,
        target_width: u32,
        target_height: u32,
    ) -> Self {
        Self {
            bus,
            metadata_topic: metadata_topic.into(),
            sink,
            target_width,
            target_height,
        }
    }

    fn extract_exif(buffer: &[u8]) -> Option<HashMap<String, String>> {
        let mut parser = nom_exif::MediaParser::new();
        let source = nom_exif::MediaSource::seekable(Cursor::new(buffer)).ok()?;
        let iter: nom_exif::ExifIter = parser.parse(source).ok()?;
        let mut exif = HashMap::new();
        for entry in iter {
            if let Some(value) = entry.get_value().ok().flatten() {
                exif.insert(format!("{:#06x}", entry.tag_code()), value.to_string());
            }
        }
        if exif.is_empty() {
            None
        } else {
            Some(exif)
        }
    }
}

#[async_trait]
impl DownstreamProcessor for ImageThumbnailProcessor {
    async fn process(&self, uuid: Uuid, _source: &Source, buffer: Vec<u8>) -> Result<(), CrawlError> {
        let decoded = image::load_from_memory(&buffer)
            .map_err(|e| CrawlError::Decode(format!("not an image: {e}")))?;

        let width = decoded.width();
        let height = decoded.height();
        let thumbnail = decoded.resize(self.target_width, self.target_height, FilterType::Nearest);

        let mut encoded = Cursor::new(Vec::new());
        thumbnail
            .write_to(&mut encoded, image::ImageFormat::Png)
            .map_err(|e| CrawlError::Decode(format!("thumbnail encode failure: {e}")))?;
        self.sink.store_thumbnail(uuid, encoded.into_inner()).await?;

        publish_json(
            self.bus.as_ref(),
            &self.metadata_topic,
            &MetadataEvent::Resolution {
                identifier: uuid,
                height,
                width,
            },
        )
        .await?;

        if let Some(exif) = Self::extract_exif(&buffer) {
            publish_json(
                self.bus.as_ref(),
                &self.metadata_topic,
                &MetadataEvent::Exif {
                    identifier: uuid,
                    exif,
                },
            )
            .await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryBus;

    struct NoopSink;

    #[async_trait]
    impl PersistenceSink for NoopSink {
        async fn store_thumbnail(&self, _uuid: Uuid, _bytes: Vec<u8>) -> Result<(), CrawlError> {
            Ok(())
        }
    }

    fn one_pixel_png() -> Vec<u8> {
        let img = image::RgbImage::from_pixel(4, 4, image::Rgb([255, 0, 0]));
        let mut buf = Cursor::new(Vec::new());
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut buf, image::ImageFormat::Png)
            .unwrap();
        buf.into_inner()
    }

    #[tokio::test]
    async fn decode_failure_maps_to_decode_error() {
        let bus = Arc::new(InMemoryBus::new());
        let processor = ImageThumbnailProcessor::new(
            bus.clone(),
            "metadata",
            Arc::new(NoopSink),
            640,
            480,
        );
        let result = processor
            .process(Uuid::nil(), &Source::new("example"), b"not an image".to_vec())
            .await;
        assert!(matches!(result, Err(CrawlError::Decode(_))));
    }

    #[tokio::test]
    async fn successful_decode_publishes_resolution_metadata() {
        let bus = Arc::new(InMemoryBus::new());
        let processor = ImageThumbnailProcessor::new(
            bus.clone(),
            "metadata",
            Arc::new(NoopSink),
            640,
            480,
        );
        processor
            .process(Uuid::nil(), &Source::new("example"), one_pixel_png())
            .await
            .unwrap();

        let published = bus.published("metadata").await;
        assert_eq!(published.len(), 1);
        assert!(published[0].contains("\"height\""));
        assert!(published[0].contains("\"width\""));
    }
}
