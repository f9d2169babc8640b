//! Illustrative [`Resolver`] implementations.
//!
//! Real upstream adapters scrape or call vendor-specific APIs that are out
//! of scope here. [`HttpJsonResolver`] shows the shape such an adapter
//! takes — a thin `reqwest` client translating the `Resolver` contract
//! into calls against a configured base URL — without committing to any
//! particular vendor's wire format.

use crate::{Cover, Resolver, ResolverError, ResolverResult, ResolvedUrl, SongInfo};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

/// A resolver that expects a companion service exposing
/// `GET {base_url}/resolve/{songId}?quality=...`,
/// `GET {base_url}/lyric/{songId}`, and
/// `GET {base_url}/info/{songId}`, each returning the obvious JSON shape.
#[derive(Debug)]
pub struct HttpJsonResolver {
    tag: &'static str,
    base_url: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct ResolveResponse {
    url: String,
    #[serde(default)]
    quality: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LyricResponse {
    lyric: String,
}

#[derive(Debug, Deserialize)]
struct InfoResponse {
    name: Option<String>,
    singer: Option<String>,
    album: Option<String>,
    cover: Option<String>,
}

impl HttpJsonResolver {
    pub fn new(tag: &'static str, base_url: impl Into<String>) -> Self {
        Self {
            tag,
            base_url: base_url.into(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("reqwest client"),
        }
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, url: &str) -> ResolverResult<T> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ResolverError::Failed(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ResolverError::Failed(format!(
                "upstream returned status {}",
                response.status()
            )));
        }
        response
            .json::<T>()
            .await
            .map_err(|e| ResolverError::Failed(e.to_string()))
    }
}

#[async_trait]
impl Resolver for HttpJsonResolver {
    fn tag(&self) -> &'static str {
        self.tag
    }

    async fn resolve(&self, song_id: &str, quality: &str) -> ResolverResult<ResolvedUrl> {
        let url = format!("{}/resolve/{song_id}?quality={quality}", self.base_url);
        let body: ResolveResponse = self.get_json(&url).await?;
        Ok(ResolvedUrl {
            url: body.url,
            quality: body.quality.unwrap_or_else(|| quality.to_string()),
        })
    }

    async fn lyric(&self, song_id: &str) -> ResolverResult<String> {
        let url = format!("{}/lyric/{song_id}", self.base_url);
        let body: LyricResponse = self.get_json(&url).await?;
        Ok(body.lyric)
    }

    async fn info(&self, song_id: &str) -> ResolverResult<SongInfo> {
        let url = format!("{}/info/{song_id}", self.base_url);
        let body: InfoResponse = self.get_json(&url).await?;
        Ok(SongInfo {
            name: body.name,
            singer: body.singer,
            album: body.album,
            cover: body.cover.map(Cover::Remote),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_is_preserved() {
        let resolver = HttpJsonResolver::new("kw", "https://example.invalid");
        assert_eq!(resolver.tag(), "kw");
    }
}
