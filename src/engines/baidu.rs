//! Baidu (百度) result pages.

use scraper::Html;

use super::{capture_url, exists, extract, finish, first_number, first_text, regex, rewrite_links};
use super::{Bucket, Field, SerpParser};
use crate::engine::{SearchEngine, SearchType};
use crate::serp::{LinkType, ParsedSerp};
use crate::Result;

pub struct BaiduParser;

const NORMAL_BUCKETS: &[Bucket] = &[
    Bucket::new(
        LinkType::Organic,
        "#content_left .result-op",
        Field::Attr("h3 > a.t", "href"),
    )
    .title(Field::Text("h3 > a.t"))
    .snippet(Field::Text(".c-abstract"))
    .visible_link(Field::Text("span.c-showurl")),
    Bucket::new(LinkType::Organic, "#content_left .result", Field::Attr("h3 > a", "href"))
        .title(Field::Text("h3 > a"))
        .snippet(Field::Text(".c-abstract, .c-span-last"))
        .visible_link(Field::Text("span.g, .c-showurl")),
];

const IMAGE_BUCKETS: &[Bucket] = &[Bucket::new(
    LinkType::Image,
    "#imgContainer .pageCon > li",
    Field::Attr(".imgShow a", "href"),
)];

impl SerpParser for BaiduParser {
    fn engine(&self) -> SearchEngine {
        SearchEngine::Baidu
    }

    fn supports(&self, search_type: SearchType) -> bool {
        matches!(search_type, SearchType::Normal | SearchType::Image)
    }

    fn parse(&self, html: &str, _query: &str, search_type: SearchType) -> Result<ParsedSerp> {
        let doc = Html::parse_document(html);
        let mut parsed = ParsedSerp {
            num_results_for_query: first_text(&doc, &["#container .nums"])?.unwrap_or_default(),
            page_number: first_number(&doc, ".fk_cur + .pc")?,
            ..Default::default()
        };

        if search_type == SearchType::Image {
            parsed.links = extract(&doc, IMAGE_BUCKETS)?;
            let re = regex(r"&objurl=(?P<url>.*?)&")?;
            rewrite_links(&mut parsed.links, LinkType::Image, |l| capture_url(&re, l));
            return Ok(finish(parsed, search_type));
        }

        parsed.links = extract(&doc, NORMAL_BUCKETS)?;
        parsed.no_results = exists(&doc, ".hit_top_new")?;

        Ok(finish(parsed, search_type))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_results() {
        let html = r#"
            <html><body><div id="container"><div class="nums">百度为您找到相关结果约1,230,000个</div>
            <div id="content_left">
              <div class="result-op"><h3><a class="t" href="https://baike.baidu.com/item/Rust">Rust 百科</a></h3>
                <div class="c-abstract">Rust是一门系统编程语言</div><span class="c-showurl">baike.baidu.com</span></div>
              <div class="result c-container"><h3><a href="http://www.baidu.com/link?url=abc">Rust 官网</a></h3>
                <div class="c-abstract">官方网站</div><span class="g">www.rust-lang.org</span></div>
              <div class="result"><h3><a href="http://www.baidu.com/link?url=abc">duplicate</a></h3></div>
            </div>
            <div id="page"><strong><span class="fk fk_cur"></span><span class="pc">9</span></strong></div>
            </div></body></html>
        "#;
        let parsed = BaiduParser.parse(html, "rust", SearchType::Normal).unwrap();
        assert_eq!(parsed.num_results, 2);
        assert_eq!(parsed.links[0].title, "Rust 百科");
        assert_eq!(parsed.links[1].visible_link, "www.rust-lang.org");
        assert_eq!(parsed.links[1].rank, 2);
        assert_eq!(parsed.page_number, Some(9));
        assert!(parsed.num_results_for_query.contains("1,230,000"));
    }

    #[test]
    fn test_hit_top_means_no_results() {
        let html = r#"<html><body><div class="hit_top_new">抱歉没有找到</div></body></html>"#;
        let parsed = BaiduParser.parse(html, "zzqx", SearchType::Normal).unwrap();
        assert!(parsed.no_results);
    }

    #[test]
    fn test_parse_images() {
        let html = r#"
            <html><body><div id="imgContainer"><ul class="pageCon">
              <li><div class="imgShow"><a href="/search/detail?ct=1&amp;objurl=http%3A%2F%2Fimg.example%2Fa.jpg&amp;fr=x">a</a></div></li>
            </ul></div></body></html>
        "#;
        let parsed = BaiduParser.parse(html, "a", SearchType::Image).unwrap();
        assert_eq!(parsed.links[0].link, "http://img.example/a.jpg");
    }
}
