//! Yandex result pages.

use scraper::Html;

use super::{capture_url, extract, finish, first_number, first_text, regex, rewrite_links};
use super::{Bucket, Field, SerpParser};
use crate::engine::{SearchEngine, SearchType};
use crate::serp::{LinkType, ParsedSerp};
use crate::Result;

/// "Nothing was found for your query."
const NOTHING_FOUND: &str = "По вашему запросу ничего не нашлось";

pub struct YandexParser;

const NORMAL_BUCKETS: &[Bucket] = &[Bucket::new(
    LinkType::Organic,
    "div.serp-list div.serp-item__wrap",
    Field::Attr("a.serp-item__title-link", "href"),
)
.title(Field::Text("a.serp-item__title-link"))
.snippet(Field::Text("div.serp-item__text"))
.visible_link(Field::Attr("a.serp-url__link", "href"))];

const IMAGE_BUCKETS: &[Bucket] = &[
    Bucket::new(
        LinkType::Image,
        ".page-layout__content-wrapper .serp-item__preview",
        Field::Attr(".serp-item__link", "onmousedown"),
    ),
    Bucket::new(
        LinkType::Image,
        ".page-layout__content-wrapper .serp-item__preview",
        Field::Attr(".serp-item__link", "href"),
    ),
];

impl SerpParser for YandexParser {
    fn engine(&self) -> SearchEngine {
        SearchEngine::Yandex
    }

    fn supports(&self, search_type: SearchType) -> bool {
        matches!(search_type, SearchType::Normal | SearchType::Image)
    }

    fn parse(&self, html: &str, _query: &str, search_type: SearchType) -> Result<ParsedSerp> {
        let doc = Html::parse_document(html);
        let mut parsed = ParsedSerp {
            num_results_for_query: first_text(&doc, &[".serp-adv .serp-item__wrap > strong"])?
                .unwrap_or_default(),
            effective_query: first_text(&doc, &[".misspell__message .misspell__link"])?
                .unwrap_or_default(),
            page_number: first_number(&doc, ".pager__group .button_checked_yes span")?,
            ..Default::default()
        };

        if search_type == SearchType::Image {
            parsed.links = extract(&doc, IMAGE_BUCKETS)?;
            let in_handler = regex(r#"\{"href"\s*:\s*"(?P<url>.*?)"\}"#)?;
            let in_query = regex(r"img_url=(?P<url>.*?)&")?;
            rewrite_links(&mut parsed.links, LinkType::Image, |l| {
                capture_url(&in_handler, l).or_else(|| capture_url(&in_query, l))
            });
            // Both buckets may resolve to the same image.
            let mut seen = std::collections::HashSet::new();
            parsed.links.retain(|l| seen.insert(l.link.clone()));
            return Ok(finish(parsed, search_type));
        }

        parsed.links = extract(&doc, NORMAL_BUCKETS)?;
        parsed.no_results = first_text(&doc, &[".message .misspell__message"])?
            .is_some_and(|text| text.contains(NOTHING_FOUND));

        Ok(finish(parsed, search_type))
    }
}
