#![forbid(unsafe_code)]

//! Minimal HLS playlist handling: enough to pick the best rendition of a
//! master playlist and list the segments of a media playlist.

use anyhow::{Context, Result, bail};
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variant {
    pub uri: String,
    pub resolution: Option<(u32, u32)>,
    pub bandwidth: Option<u64>,
}

impl Variant {
    pub fn area(&self) -> u64 {
        self.resolution
            .map(|(width, height)| u64::from(width) * u64::from(height))
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Playlist {
    Master(Vec<Variant>),
    Media(Vec<String>),
}

pub fn parse_playlist(text: &str) -> Result<Playlist> {
    let mut lines = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty());
    match lines.next() {
        Some(first) if first.starts_with("#EXTM3U") => {}
        _ => bail!("not an M3U playlist"),
    }

    let lines: Vec<&str> = lines.collect();
    if lines.iter().any(|line| line.starts_with("#EXT-X-STREAM-INF")) {
        let mut variants = Vec::new();
        let mut pending: Option<Vec<(String, String)>> = None;
        for line in lines {
            if let Some(attributes) = line.strip_prefix("#EXT-X-STREAM-INF:") {
                pending = Some(parse_attributes(attributes));
            } else if line.starts_with('#') {
                continue;
            } else if let Some(attributes) = pending.take() {
                variants.push(variant_from(line, &attributes));
            }
        }
        if variants.is_empty() {
            bail!("master playlist lists no variants");
        }
        Ok(Playlist::Master(variants))
    } else {
        let segments: Vec<String> = lines
            .into_iter()
            .filter(|line| !line.starts_with('#'))
            .map(str::to_string)
            .collect();
        if segments.is_empty() {
            bail!("media playlist lists no segments");
        }
        Ok(Playlist::Media(segments))
    }
}

fn variant_from(uri: &str, attributes: &[(String, String)]) -> Variant {
    let value = |key: &str| {
        attributes
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(key))
            .map(|(_, value)| value.as_str())
    };
    let resolution = value("RESOLUTION").and_then(|raw| {
        let (width, height) = raw.split_once(['x', 'X'])?;
        Some((width.trim().parse().ok()?, height.trim().parse().ok()?))
    });
    Variant {
        uri: uri.to_string(),
        resolution,
        bandwidth: value("BANDWIDTH").and_then(|raw| raw.trim().parse().ok()),
    }
}

/// Splits an attribute list on commas outside quoted values.
pub fn parse_attributes(raw: &str) -> Vec<(String, String)> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for ch in raw.chars() {
        match ch {
            '"' => {
                quoted = !quoted;
                current.push(ch);
            }
            ',' if !quoted => fields.push(std::mem::take(&mut current)),
            _ => current.push(ch),
        }
    }
    fields.push(current);

    fields
        .into_iter()
        .filter_map(|field| {
            let (key, value) = field.split_once('=')?;
            Some((
                key.trim().to_string(),
                value.trim().trim_matches('"').to_string(),
            ))
        })
        .collect()
}

/// Largest pixel area; the first variant wins on ties.
pub fn best_variant(variants: &[Variant]) -> Option<&Variant> {
    variants.iter().fold(None, |best: Option<&Variant>, variant| match best {
        Some(current) if variant.area() <= current.area() => Some(current),
        _ => Some(variant),
    })
}

pub fn resolve_uri(base: &str, uri: &str) -> Result<String> {
    let base = Url::parse(base).with_context(|| format!("invalid playlist URL {base}"))?;
    let resolved = base
        .join(uri)
        .with_context(|| format!("cannot resolve {uri} against {base}"))?;
    Ok(resolved.to_string())
}
