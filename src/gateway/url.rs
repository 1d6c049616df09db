//! Pure predicates over request URLs.

use url::Url;

/// Clinical REST resources live under this prefix.
const API_PREFIX: &str = "/api/";

/// First path segments under `/api/` that are never cached: administrative,
/// compliance, FHIR and AI-provider state is sensitive or changes too fast.
const UNCACHEABLE_SECTIONS: &[&str] = &["admin", "compliance", "fhir", "ai"];

/// Collections whose member id is the owning entity of everything beneath it.
const ENTITY_COLLECTIONS: &[&str] = &["visits"];

/// Path component of a relative or absolute URL, without query or fragment.
pub fn request_path(url: &str) -> String {
  match Url::parse(url) {
    Ok(parsed) => parsed.path().to_string(),
    Err(_) => url
      .split(['?', '#'])
      .next()
      .unwrap_or_default()
      .to_string(),
  }
}

fn segments(path: &str) -> impl Iterator<Item = &str> {
  path.split('/').filter(|s| !s.is_empty())
}

/// Whether successful reads of `url` should be written to the response cache.
pub fn is_cacheable(url: &str) -> bool {
  let path = request_path(url);
  let Some(rest) = path.strip_prefix(API_PREFIX) else {
    return false;
  };
  let cacheable = match segments(rest).next() {
    Some(section) => !UNCACHEABLE_SECTIONS.contains(&section),
    None => false,
  };
  cacheable
}

/// Owning entity id, e.g. `v1` for `/api/visits/v1/vitals`.
pub fn entity_id(url: &str) -> Option<String> {
  let path = request_path(url);
  let mut parts = segments(&path);
  while let Some(part) = parts.next() {
    if ENTITY_COLLECTIONS.contains(&part) {
      return parts.next().map(String::from);
    }
  }
  None
}

/// Classification tag for a mutation: the last path segment.
pub fn kind(url: &str) -> String {
  let path = request_path(url);
  let last = segments(&path).last().map(String::from);
  last.unwrap_or_else(|| "root".to_string())
}
