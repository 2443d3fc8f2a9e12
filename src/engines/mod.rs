//! Result page parsers.
//!
//! Each engine gets a [`SerpParser`] that turns a fetched page into a
//! [`ParsedSerp`]. Most of them are tables of [`Bucket`]s fed through the
//! shared extraction helpers below, plus a little engine specific
//! post-processing (redirect cleanup, "no results" detection).

mod ask;
mod baidu;
mod bing;
mod duckduckgo;
mod google;
mod yahoo;
mod yandex;

use std::collections::HashSet;

use regex::Regex;
use scraper::{ElementRef, Html, Selector};

pub use ask::AskParser;
pub use baidu::BaiduParser;
pub use bing::BingParser;
pub use duckduckgo::DuckDuckGoParser;
pub use google::GoogleParser;
pub use yahoo::YahooParser;
pub use yandex::YandexParser;

use crate::engine::{SearchEngine, SearchType};
use crate::serp::{Link, LinkType, ParsedSerp};
use crate::{Result, ScrapeError};

/// Extracts links and metadata from an engine's result page.
pub trait SerpParser: Send + Sync {
    /// Engine whose markup this parser understands.
    fn engine(&self) -> SearchEngine;

    /// Whether pages of this search type can be parsed.
    fn supports(&self, search_type: SearchType) -> bool {
        search_type == SearchType::Normal
    }

    /// Parses one page. `query` is the query the page was requested for.
    fn parse(&self, html: &str, query: &str, search_type: SearchType) -> Result<ParsedSerp>;
}

/// Parser for an engine.
pub fn parser_for(engine: SearchEngine) -> &'static dyn SerpParser {
    match engine {
        SearchEngine::Google => &GoogleParser,
        SearchEngine::Yandex => &YandexParser,
        SearchEngine::Bing => &BingParser,
        SearchEngine::Yahoo => &YahooParser,
        SearchEngine::Baidu => &BaiduParser,
        SearchEngine::DuckDuckGo => &DuckDuckGoParser,
        SearchEngine::Ask => &AskParser,
    }
}

/// Parses `html` with the engine's parser.
///
/// Blank pages and unsupported search types are parse errors; a page
/// without any recognizable result is not.
pub fn parse_page(
    engine: SearchEngine,
    html: &str,
    query: &str,
    search_type: SearchType,
) -> Result<ParsedSerp> {
    if html.trim().is_empty() {
        return Err(ScrapeError::Parse(format!("{} returned an empty page", engine)));
    }
    let parser = parser_for(engine);
    if !parser.supports(search_type) {
        return Err(ScrapeError::Parse(format!(
            "{} has no parser for {} search",
            engine, search_type
        )));
    }
    parser.parse(html, query, search_type)
}

/// Link type counted as the page's main result list.
pub fn primary_link_type(search_type: SearchType) -> LinkType {
    match search_type {
        SearchType::Normal => LinkType::Organic,
        SearchType::Image => LinkType::Image,
        SearchType::Video => LinkType::Video,
        SearchType::News => LinkType::News,
    }
}

/// Where a link attribute comes from, relative to a result container.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Field {
    /// Text content of the first matching element.
    Text(&'static str),
    /// Attribute of the first matching element.
    Attr(&'static str, &'static str),
}

impl Field {
    fn extract(&self, element: ElementRef<'_>) -> Result<Option<String>> {
        match *self {
            Field::Text(css) => {
                let sel = selector(css)?;
                Ok(element.select(&sel).next().map(element_text))
            }
            Field::Attr(css, attr) => {
                let sel = selector(css)?;
                Ok(element
                    .select(&sel)
                    .find_map(|el| el.value().attr(attr))
                    .map(|v| v.trim().to_string()))
            }
        }
    }
}

/// One kind of result block on a page.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Bucket {
    pub link_type: LinkType,
    pub container: &'static str,
    pub link: Field,
    pub title: Option<Field>,
    pub snippet: Option<Field>,
    pub visible_link: Option<Field>,
}

impl Bucket {
    pub const fn new(link_type: LinkType, container: &'static str, link: Field) -> Self {
        Self {
            link_type,
            container,
            link,
            title: None,
            snippet: None,
            visible_link: None,
        }
    }

    pub const fn title(mut self, field: Field) -> Self {
        self.title = Some(field);
        self
    }

    pub const fn snippet(mut self, field: Field) -> Self {
        self.snippet = Some(field);
        self
    }

    pub const fn visible_link(mut self, field: Field) -> Self {
        self.visible_link = Some(field);
        self
    }
}

pub(crate) fn selector(css: &str) -> Result<Selector> {
    Selector::parse(css)
        .map_err(|e| ScrapeError::Parse(format!("Failed to parse selector: {:?}", e)))
}

pub(crate) fn regex(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| ScrapeError::Parse(format!("Failed to parse regex: {}", e)))
}

/// Element text with whitespace runs collapsed.
pub(crate) fn element_text(element: ElementRef<'_>) -> String {
    normalize(&element.text().collect::<String>())
}

pub(crate) fn normalize(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Collects the links of all buckets in order.
///
/// Entries without a link are skipped, and a link already seen for the
/// same link type is dropped. Ranks are left at zero; see [`finish`].
pub(crate) fn extract(doc: &Html, buckets: &[Bucket]) -> Result<Vec<Link>> {
    let mut seen: HashSet<(LinkType, String)> = HashSet::new();
    let mut links = Vec::new();

    for bucket in buckets {
        let container = selector(bucket.container)?;
        for element in doc.select(&container) {
            let Some(href) = bucket.link.extract(element)? else {
                continue;
            };
            if href.is_empty() || !seen.insert((bucket.link_type, href.clone())) {
                continue;
            }

            let mut link = Link::new(bucket.link_type, href);
            if let Some(field) = bucket.title {
                link.title = field.extract(element)?.unwrap_or_default();
            }
            if let Some(field) = bucket.snippet {
                link.snippet = field.extract(element)?.unwrap_or_default();
            }
            if let Some(field) = bucket.visible_link {
                link.visible_link = field.extract(element)?.unwrap_or_default();
            }
            links.push(link);
        }
    }

    Ok(links)
}

/// Text of the first element matching any of `selectors`.
pub(crate) fn first_text(doc: &Html, selectors: &[&str]) -> Result<Option<String>> {
    for css in selectors {
        let sel = selector(css)?;
        if let Some(text) = doc.select(&sel).map(element_text).find(|t| !t.is_empty()) {
            return Ok(Some(text));
        }
    }
    Ok(None)
}

/// First number in the text of the first element matching `css`.
pub(crate) fn first_number(doc: &Html, css: &str) -> Result<Option<u32>> {
    let Some(text) = first_text(doc, &[css])? else {
        return Ok(None);
    };
    let digits: String = text
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    Ok(digits.parse().ok())
}

pub(crate) fn exists(doc: &Html, css: &str) -> Result<bool> {
    let sel = selector(css)?;
    Ok(doc.select(&sel).next().is_some())
}

/// Pulls the `url` capture group out of a redirect link and percent-decodes it.
pub(crate) fn capture_url(re: &Regex, link: &str) -> Option<String> {
    let raw = re.captures(link)?.name("url")?.as_str();
    Some(
        urlencoding::decode(raw)
            .map(|d| d.into_owned())
            .unwrap_or_else(|_| raw.to_string()),
    )
}

/// Rewrites every link of `link_type` with `clean`, keeping the original
/// when `clean` returns `None`.
pub(crate) fn rewrite_links(
    links: &mut [Link],
    link_type: LinkType,
    clean: impl Fn(&str) -> Option<String>,
) {
    for link in links.iter_mut().filter(|l| l.link_type == link_type) {
        if let Some(cleaned) = clean(&link.link) {
            link.domain = crate::serp::domain_of(&cleaned);
            link.link = cleaned;
        }
    }
}

/// Ranks the links and settles the result count.
///
/// Ranks run 1..n across the whole page in extraction order. A page whose
/// main list is empty is always a "no results" page.
pub(crate) fn finish(mut parsed: ParsedSerp, search_type: SearchType) -> ParsedSerp {
    for (i, link) in parsed.links.iter_mut().enumerate() {
        link.rank = i as u32 + 1;
    }
    let primary = primary_link_type(search_type);
    if parsed.links_of(primary).next().is_none() {
        parsed.no_results = true;
    }
    parsed.count_results(primary);
    parsed
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"
        <html><body>
          <div class="r"><a href="http://a.example/">A  one</a><p>first
             snippet</p></div>
          <div class="r"><a href="">empty</a></div>
          <div class="r"><a href="http://a.example/">dup</a></div>
          <div class="r"><a href="http://b.example/x">B</a><span class="pg">Page 4 of 9</span></div>
          <div class="ad"><a href="http://a.example/">ad for a</a></div>
        </body></html>
    "#;

    const BUCKETS: &[Bucket] = &[
        Bucket::new(LinkType::Organic, "div.r", Field::Attr("a", "href"))
            .title(Field::Text("a"))
            .snippet(Field::Text("p")),
        Bucket::new(LinkType::AdMain, "div.ad", Field::Attr("a", "href")),
    ];

    #[test]
    fn test_extract_skips_empty_and_duplicate_links() {
        let doc = Html::parse_document(PAGE);
        let links = extract(&doc, BUCKETS).unwrap();
        assert_eq!(links.len(), 3);
        assert_eq!(links[0].title, "A one");
        assert_eq!(links[0].snippet, "first snippet");
        assert_eq!(links[0].domain, "a.example");
        assert_eq!(links[1].link, "http://b.example/x");
        // same URL, different link type
        assert_eq!(links[2].link_type, LinkType::AdMain);
    }

    #[test]
    fn test_finish_ranks_contiguously() {
        let doc = Html::parse_document(PAGE);
        let parsed = ParsedSerp {
            links: extract(&doc, BUCKETS).unwrap(),
            ..Default::default()
        };
        let parsed = finish(parsed, SearchType::Normal);
        let ranks: Vec<u32> = parsed.links.iter().map(|l| l.rank).collect();
        assert_eq!(ranks, vec![1, 2, 3]);
        assert_eq!(parsed.num_results, 2);
        assert!(!parsed.no_results);
    }

    #[test]
    fn test_finish_empty_main_list_means_no_results() {
        let parsed = ParsedSerp {
            links: vec![Link::new(LinkType::AdMain, "http://ad/")],
            ..Default::default()
        };
        let parsed = finish(parsed, SearchType::Normal);
        assert!(parsed.no_results);
        assert_eq!(parsed.num_results, 0);
    }

    #[test]
    fn test_first_text_and_number() {
        let doc = Html::parse_document(PAGE);
        assert_eq!(first_text(&doc, &["#nope", "div.r p"]).unwrap().unwrap(), "first snippet");
        assert_eq!(first_number(&doc, "span.pg").unwrap(), Some(4));
        assert_eq!(first_number(&doc, "#nope").unwrap(), None);
        assert!(exists(&doc, "div.ad").unwrap());
    }

    #[test]
    fn test_capture_url_decodes() {
        let re = regex(r"/url\?q=(?P<url>.*?)&sa=U&ei=").unwrap();
        let cleaned = capture_url(&re, "/url?q=http://x.example/a%20b&sa=U&ei=abc");
        assert_eq!(cleaned.as_deref(), Some("http://x.example/a b"));
        assert_eq!(capture_url(&re, "http://plain/"), None);
    }

    #[test]
    fn test_parse_page_rejects_blank_and_unsupported() {
        assert!(parse_page(SearchEngine::Bing, "  \n", "q", SearchType::Normal).is_err());
        assert!(parse_page(SearchEngine::Ask, "<html></html>", "q", SearchType::Image).is_err());
        let parsed = parse_page(SearchEngine::Ask, "<html></html>", "q", SearchType::Normal).unwrap();
        assert!(parsed.no_results);
    }

    #[test]
    fn test_registry() {
        for engine in SearchEngine::ALL {
            assert_eq!(parser_for(engine).engine(), engine);
            assert!(parser_for(engine).supports(SearchType::Normal));
        }
        assert_eq!(
            parser_for("bing".parse().unwrap()).engine(),
            SearchEngine::Bing
        );
        assert!(matches!(
            "lycos".parse::<SearchEngine>(),
            Err(ScrapeError::UnknownEngine(_))
        ));
    }
}
