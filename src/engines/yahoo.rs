//! Yahoo result pages.

use scraper::Html;

use super::{exists, extract, finish, first_number, first_text, regex, rewrite_links};
use super::{Bucket, Field, SerpParser};
use crate::engine::{SearchEngine, SearchType};
use crate::serp::{LinkType, ParsedSerp};
use crate::Result;

pub struct YahooParser;

const NORMAL_BUCKETS: &[Bucket] = &[Bucket::new(
    LinkType::Organic,
    "#main .res",
    Field::Attr("div > h3 > a", "href"),
)
.title(Field::Text("div > h3 > a"))
.snippet(Field::Text("div.abstr"))
.visible_link(Field::Text("span.url"))];

const IMAGE_BUCKETS: &[Bucket] = &[Bucket::new(
    LinkType::Image,
    "#results #sres > li",
    Field::Attr("a", "href"),
)];

impl SerpParser for YahooParser {
    fn engine(&self) -> SearchEngine {
        SearchEngine::Yahoo
    }

    fn supports(&self, search_type: SearchType) -> bool {
        matches!(search_type, SearchType::Normal | SearchType::Image)
    }

    fn parse(&self, html: &str, _query: &str, search_type: SearchType) -> Result<ParsedSerp> {
        let doc = Html::parse_document(html);
        let mut parsed = ParsedSerp {
            num_results_for_query: first_text(&doc, &["#pg > span:last-child"])?
                .unwrap_or_default(),
            page_number: first_number(&doc, "#pg > strong")?,
            ..Default::default()
        };

        if search_type == SearchType::Image {
            parsed.links = extract(&doc, IMAGE_BUCKETS)?;
            let re = regex(r"&imgurl=(?P<url>.*?)&")?;
            rewrite_links(&mut parsed.links, LinkType::Image, |l| {
                let raw = re.captures(l)?.name("url")?.as_str();
                let decoded = urlencoding::decode(raw).ok()?;
                Some(format!("http://{}", decoded))
            });
            return Ok(finish(parsed, search_type));
        }

        parsed.links = extract(&doc, NORMAL_BUCKETS)?;
        // Entries without a display URL are sponsored widgets.
        parsed.links.retain(|l| !l.visible_link.is_empty());
        parsed.no_results = exists(&doc, "#cquery")?;

        Ok(finish(parsed, search_type))
    }
}
