//! DuckDuckGo result pages, both the HTML endpoint and the scripted page.

use scraper::Html;

use super::{extract, finish, first_text, rewrite_links, Bucket, Field, SerpParser};
use crate::engine::{SearchEngine, SearchType};
use crate::serp::{LinkType, ParsedSerp};
use crate::Result;

pub struct DuckDuckGoParser;

const NORMAL_BUCKETS: &[Bucket] = &[
    Bucket::new(
        LinkType::Organic,
        "#links .result",
        Field::Attr(".result__title > a", "href"),
    )
    .title(Field::Text(".result__title > a"))
    .snippet(Field::Text(".result__snippet"))
    .visible_link(Field::Text(".result__url__domain, .result__url")),
    Bucket::new(
        LinkType::Organic,
        ".result",
        Field::Attr(".result__title a", "href"),
    )
    .title(Field::Text(".result__title a"))
    .snippet(Field::Text(".result__snippet"))
    .visible_link(Field::Text(".result__url")),
];

impl SerpParser for DuckDuckGoParser {
    fn engine(&self) -> SearchEngine {
        SearchEngine::DuckDuckGo
    }

    fn parse(&self, html: &str, _query: &str, search_type: SearchType) -> Result<ParsedSerp> {
        let doc = Html::parse_document(html);
        let mut parsed = ParsedSerp {
            links: extract(&doc, NORMAL_BUCKETS)?,
            ..Default::default()
        };
        rewrite_links(&mut parsed.links, LinkType::Organic, extract_redirect_url);
        parsed.no_results = first_text(&doc, &[".no-results"])?
            .is_some_and(|text| text.contains("No more results."));

        Ok(finish(parsed, search_type))
    }
}

/// Target of a `//duckduckgo.com/l/?uddg=...` redirect link.
fn extract_redirect_url(url: &str) -> Option<String> {
    let rest = url
        .strip_prefix("//duckduckgo.com/l/?uddg=")
        .or_else(|| url.strip_prefix("https://duckduckgo.com/l/?uddg="))?;
    let decoded = urlencoding::decode(rest).ok()?;
    let end = decoded.find('&').unwrap_or(decoded.len());
    Some(decoded[..end].to_string())
}
