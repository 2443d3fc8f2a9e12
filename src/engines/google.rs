//! Google result pages.

use scraper::Html;

use super::{
    capture_url, extract, finish, first_number, first_text, primary_link_type, regex,
    rewrite_links, Bucket, Field, SerpParser,
};
use crate::engine::{SearchEngine, SearchType};
use crate::serp::{LinkType, ParsedSerp};
use crate::Result;

const NO_RESULTS_NEEDLES: &[&str] = &["No results found for", "did not match any documents"];

/// Parser for Google web, image, video and news pages.
pub struct GoogleParser;

/// Web result buckets. Video and news pages share the markup, so the main
/// list is tagged with the page's own link type.
fn result_buckets(main: LinkType) -> [Bucket; 5] {
    [
        Bucket::new(main, "#center_col li.g", Field::Attr("h3.r > a:first-child", "href"))
            .title(Field::Text("h3.r > a:first-child"))
            .snippet(Field::Text("div.s span.st"))
            .visible_link(Field::Text("cite")),
        Bucket::new(main, "#search div.g", Field::Attr("a[href]", "href"))
            .title(Field::Text("h3"))
            .snippet(Field::Text("div[data-sncf], div.VwiC3b"))
            .visible_link(Field::Text("cite")),
        Bucket::new(main, "li.card-section", Field::Attr("a._Dk", "href"))
            .title(Field::Text("a._Dk"))
            .snippet(Field::Text("span._dwd"))
            .visible_link(Field::Text("cite")),
        Bucket::new(
            LinkType::AdMain,
            "#center_col li.ads-ad",
            Field::Attr("h3.r > a:first-child", "href"),
        )
        .title(Field::Text("h3.r > a:first-child"))
        .snippet(Field::Text("div.s span.st"))
        .visible_link(Field::Text(".ads-visurl cite")),
        Bucket::new(
            LinkType::AdMain,
            "#center_col .ads-ad",
            Field::Attr("h3 > a:first-child", "href"),
        )
        .title(Field::Text("h3 > a:first-child"))
        .snippet(Field::Text(".ads-creative"))
        .visible_link(Field::Text(".ads-visurl cite")),
    ]
}

const IMAGE_BUCKETS: &[Bucket] = &[
    Bucket::new(
        LinkType::Image,
        "li#isr_mc div.rg_di",
        Field::Attr("a.rg_l", "href"),
    ),
    Bucket::new(LinkType::Image, ".images_table tr td", Field::Attr("a", "href"))
        .visible_link(Field::Text("cite")),
];

impl SerpParser for GoogleParser {
    fn engine(&self) -> SearchEngine {
        SearchEngine::Google
    }

    fn supports(&self, _search_type: SearchType) -> bool {
        true
    }

    fn parse(&self, html: &str, query: &str, search_type: SearchType) -> Result<ParsedSerp> {
        let doc = Html::parse_document(html);

        let mut parsed = ParsedSerp {
            num_results_for_query: first_text(&doc, &["#resultStats"])?.unwrap_or_default(),
            effective_query: first_text(&doc, &["#topstuff .med > b"])?.unwrap_or_default(),
            page_number: first_number(&doc, "#navcnt td.cur")?,
            ..Default::default()
        };

        if search_type == SearchType::Image {
            parsed.links = extract(&doc, IMAGE_BUCKETS)?;
            let re = regex(r"imgres\?imgurl=(?P<url>.*?)&")?;
            rewrite_links(&mut parsed.links, LinkType::Image, |l| capture_url(&re, l));
            return Ok(finish(parsed, search_type));
        }

        let main = primary_link_type(search_type);
        parsed.links = extract(&doc, &result_buckets(main))?;

        let re = regex(r"/url\?q=(?P<url>.*?)&sa=U&ei=")?;
        rewrite_links(&mut parsed.links, main, |l| {
            capture_url(&re, l).or_else(|| strip_redirect(l))
        });
        // In-page links such as "/search?q=..." are not results.
        parsed
            .links
            .retain(|l| !(l.link_type == main && l.link.starts_with('/')));

        let has_main = parsed.links.iter().any(|l| l.link_type == main);
        parsed.no_results =
            !has_main || NO_RESULTS_NEEDLES.iter().any(|needle| html.contains(needle));

        // The notice is also shown above results for a relaxed query.
        let bare_query = query.replace('"', "");
        if parsed.no_results
            && !bare_query.trim().is_empty()
            && parsed.links.iter().any(|l| l.snippet.contains(&bare_query))
        {
            parsed.no_results = false;
        }

        Ok(finish(parsed, search_type))
    }
}

/// `/url?q=<target>&...` without the `sa=U` marker.
fn strip_redirect(link: &str) -> Option<String> {
    let rest = link.strip_prefix("/url?q=")?;
    let target = rest.split('&').next().unwrap_or(rest);
    urlencoding::decode(target).ok().map(|d| d.into_owned())
}
