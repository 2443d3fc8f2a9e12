//! Bing result pages.

use scraper::Html;

use super::{capture_url, extract, finish, first_number, first_text, regex, rewrite_links};
use super::{Bucket, Field, SerpParser};
use crate::engine::{SearchEngine, SearchType};
use crate::serp::{LinkType, ParsedSerp};
use crate::Result;

pub struct BingParser;

const NORMAL_BUCKETS: &[Bucket] = &[
    Bucket::new(LinkType::Organic, "#b_results .b_algo", Field::Attr("h2 > a", "href"))
        .title(Field::Text("h2"))
        .snippet(Field::Text(".b_caption > p"))
        .visible_link(Field::Text("cite")),
    Bucket::new(LinkType::AdMain, "#b_results .b_ad .sb_add", Field::Attr("h2 > a", "href"))
        .title(Field::Text("h2 > a"))
        .snippet(Field::Text(".sb_addesc, .b_caption > p"))
        .visible_link(Field::Text("cite")),
    Bucket::new(LinkType::News, "ul.b_vList li", Field::Attr("h5 a", "href"))
        .title(Field::Text("h5 a"))
        .snippet(Field::Text("p"))
        .visible_link(Field::Text("cite")),
];

const IMAGE_BUCKETS: &[Bucket] = &[Bucket::new(
    LinkType::Image,
    "#dg_c .imgres .dg_u",
    Field::Attr("a.dv_i", "m"),
)];

impl SerpParser for BingParser {
    fn engine(&self) -> SearchEngine {
        SearchEngine::Bing
    }

    fn supports(&self, search_type: SearchType) -> bool {
        matches!(search_type, SearchType::Normal | SearchType::Image)
    }

    fn parse(&self, html: &str, query: &str, search_type: SearchType) -> Result<ParsedSerp> {
        let doc = Html::parse_document(html);
        let mut parsed = ParsedSerp {
            num_results_for_query: first_text(&doc, &[".sb_count"])?.unwrap_or_default(),
            effective_query: first_text(&doc, &["#sp_requery a > strong"])?.unwrap_or_default(),
            page_number: first_number(&doc, ".sb_pagS")?,
            ..Default::default()
        };

        if search_type == SearchType::Image {
            parsed.links = extract(&doc, IMAGE_BUCKETS)?;
            // The `m` attribute holds a JS object literal with the image URL.
            let re = regex(r#"imgurl:"(?P<url>.*?)""#)?;
            rewrite_links(&mut parsed.links, LinkType::Image, |l| capture_url(&re, l));
            return Ok(finish(parsed, search_type));
        }

        parsed.links = extract(&doc, NORMAL_BUCKETS)?;
        if let Some(answer) = first_text(&doc, &["#b_results > .b_ans"])? {
            parsed.no_results = (!query.trim().is_empty() && answer.contains(query))
                || answer.contains("Do you want results only for");
        }

        Ok(finish(parsed, search_type))
    }
}
