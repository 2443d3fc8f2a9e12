//! Ask.com result pages.

use scraper::Html;

use super::{extract, finish, first_number, first_text, Bucket, Field, SerpParser};
use crate::engine::{SearchEngine, SearchType};
use crate::serp::{LinkType, ParsedSerp};
use crate::Result;

pub struct AskParser;

const NORMAL_BUCKETS: &[Bucket] = &[Bucket::new(
    LinkType::Organic,
    "#midblock .ptbs.ur",
    Field::Attr(".abstract > a", "href"),
)
.title(Field::Text(".txt_lg.b"))
.snippet(Field::Text(".abstract"))
.visible_link(Field::Text(".durl span"))];

impl SerpParser for AskParser {
    fn engine(&self) -> SearchEngine {
        SearchEngine::Ask
    }

    fn parse(&self, html: &str, _query: &str, search_type: SearchType) -> Result<ParsedSerp> {
        let doc = Html::parse_document(html);
        let parsed = ParsedSerp {
            effective_query: first_text(&doc, &["#spell-check-result > a"])?.unwrap_or_default(),
            page_number: first_number(&doc, ".pgcsel .pg")?,
            links: extract(&doc, NORMAL_BUCKETS)?,
            ..Default::default()
        };
        Ok(finish(parsed, search_type))
    }
}
