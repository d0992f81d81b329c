//! Turning a decoded response body into indexable text.

use std::io::Read;

use once_cell::sync::OnceCell;
use regex::Regex;
use url::Url;

use crate::error::{Result, TrawlError};
use crate::types::{DistillOutcome, DocMeta, RejectReason};

/// Accepts or rejects a document and extracts its text.
pub trait Distiller {
    fn distill(&self, content: &mut dyn Read, meta: DocMeta) -> Result<DistillOutcome>;
}

impl<T: Distiller + ?Sized> Distiller for Box<T> {
    fn distill(&self, content: &mut dyn Read, meta: DocMeta) -> Result<DistillOutcome> {
        (**self).distill(content, meta)
    }
}

pub const DEFAULT_MIN_TEXT_CHARS: usize = 40;

/// Regex-based HTML stripper for `html` and `txt` content.
#[derive(Debug, Clone)]
pub struct HtmlDistiller {
    /// Hosts (and their subdomains) never archived.
    pub excluded_domains: Vec<String>,
    /// Documents with less extracted text than this are rejected.
    pub min_text_chars: usize,
}

impl Default for HtmlDistiller {
    fn default() -> Self {
        Self {
            excluded_domains: Vec::new(),
            min_text_chars: DEFAULT_MIN_TEXT_CHARS,
        }
    }
}

struct Patterns {
    script: Regex,
    style: Regex,
    comment: Regex,
    frameset: Regex,
    title: Regex,
    description: Regex,
    tag: Regex,
    space: Regex,
}

fn patterns() -> Result<&'static Patterns> {
    static PATTERNS: OnceCell<std::result::Result<Patterns, String>> = OnceCell::new();
    let compiled = PATTERNS.get_or_init(|| {
        let re = |pattern: &str| Regex::new(pattern).map_err(|err| err.to_string());
        Ok(Patterns {
            script: re(r"(?is)<script\b.*?</script\s*>")?,
            style: re(r"(?is)<style\b.*?</style\s*>")?,
            comment: re(r"(?s)<!--.*?-->")?,
            frameset: re(r"(?i)<frameset\b")?,
            title: re(r"(?is)<title\b[^>]*>(.*?)</title\s*>")?,
            description: re(
                r#"(?is)<meta\s+[^>]*name\s*=\s*["']?description["']?[^>]*content\s*=\s*["']([^"']*)["']"#,
            )?,
            tag: re(r"(?s)<[^>]*>")?,
            space: re(r"\s+")?,
        })
    });
    compiled.as_ref().map_err(|reason| TrawlError::Distill {
        reason: reason.clone(),
    })
}

impl HtmlDistiller {
    fn is_excluded(&self, uri: &str) -> bool {
        let Some(host) = Url::parse(uri).ok().and_then(|url| url.host_str().map(str::to_ascii_lowercase))
        else {
            return false;
        };
        self.excluded_domains.iter().any(|domain| {
            let domain = domain.trim_start_matches('.').to_ascii_lowercase();
            host == domain || host.ends_with(&format!(".{domain}"))
        })
    }
}

impl Distiller for HtmlDistiller {
    fn distill(&self, content: &mut dyn Read, mut meta: DocMeta) -> Result<DistillOutcome> {
        if self.is_excluded(&meta.uri) {
            return Ok(DistillOutcome::Reject(RejectReason::ExcludedDomain));
        }
        let is_html = match meta.content_type.as_str() {
            "html" => true,
            "txt" => false,
            _ => return Ok(DistillOutcome::Reject(RejectReason::NonHtml)),
        };

        let mut raw = Vec::new();
        if let Err(err) = content.read_to_end(&mut raw) {
            tracing::debug!(uri = %meta.uri, error = %err, "body unreadable");
            return Ok(DistillOutcome::Reject(RejectReason::ParseError));
        }
        let source = String::from_utf8_lossy(&raw);

        let text = if is_html {
            let p = patterns()?;
            if p.frameset.is_match(&source) {
                return Ok(DistillOutcome::Reject(RejectReason::Frameset));
            }
            if meta.title.is_none() {
                meta.title = p
                    .title
                    .captures(&source)
                    .map(|caps| collapse(p, &decode_entities(&caps[1])))
                    .filter(|title| !title.is_empty());
            }
            if meta.description.is_none() {
                meta.description = p
                    .description
                    .captures(&source)
                    .map(|caps| collapse(p, &decode_entities(&caps[1])))
                    .filter(|desc| !desc.is_empty());
            }
            let body = p.script.replace_all(&source, " ");
            let body = p.style.replace_all(&body, " ");
            let body = p.comment.replace_all(&body, " ");
            let body = p.title.replace_all(&body, " ");
            let body = p.tag.replace_all(&body, " ");
            collapse(p, &decode_entities(&body))
        } else {
            source.split_whitespace().collect::<Vec<_>>().join(" ")
        };

        if text.chars().count() < self.min_text_chars {
            return Ok(DistillOutcome::Reject(RejectReason::LowContent));
        }
        Ok(DistillOutcome::Accept { text, meta })
    }
}

fn collapse(p: &Patterns, text: &str) -> String {
    p.space.replace_all(text, " ").trim().to_string()
}

fn decode_entities(text: &str) -> String {
    if !text.contains('&') {
        return text.to_string();
    }
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
