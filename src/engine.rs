//! Search engine catalogue.
//!
//! Every supported engine is described by one static [`EngineProfile`]:
//! base URLs, GET parameter names, browser landing pages and selectors,
//! and the needles that reveal a blocking page. Transports and parsers
//! read engine specifics from here instead of branching per engine.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Result, ScrapeError};

/// A supported search engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchEngine {
    Google,
    Yandex,
    Bing,
    Yahoo,
    Baidu,
    #[serde(rename = "duckduckgo")]
    DuckDuckGo,
    Ask,
}

impl SearchEngine {
    /// All supported engines, in the order `*` expands to.
    pub const ALL: [SearchEngine; 7] = [
        SearchEngine::Google,
        SearchEngine::Yandex,
        SearchEngine::Bing,
        SearchEngine::Yahoo,
        SearchEngine::Baidu,
        SearchEngine::DuckDuckGo,
        SearchEngine::Ask,
    ];

    /// Lowercase engine name as used in configuration and output.
    pub fn name(&self) -> &'static str {
        self.profile().name
    }

    /// Returns the static profile for this engine.
    pub fn profile(&self) -> &'static EngineProfile {
        match self {
            SearchEngine::Google => &GOOGLE,
            SearchEngine::Yandex => &YANDEX,
            SearchEngine::Bing => &BING,
            SearchEngine::Yahoo => &YAHOO,
            SearchEngine::Baidu => &BAIDU,
            SearchEngine::DuckDuckGo => &DUCKDUCKGO,
            SearchEngine::Ask => &ASK,
        }
    }

    /// Parses a comma separated engine list. `*` selects every engine.
    pub fn parse_list(list: &str) -> Result<Vec<SearchEngine>> {
        let mut engines = Vec::new();
        for name in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            if name == "*" {
                return Ok(Self::ALL.to_vec());
            }
            let engine: SearchEngine = name.parse()?;
            if !engines.contains(&engine) {
                engines.push(engine);
            }
        }
        Ok(engines)
    }
}

impl fmt::Display for SearchEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SearchEngine {
    type Err = ScrapeError;

    fn from_str(s: &str) -> Result<Self> {
        let lowered = s.trim().to_lowercase();
        Self::ALL
            .into_iter()
            .find(|engine| engine.name() == lowered)
            .ok_or_else(|| ScrapeError::UnknownEngine(s.trim().to_string()))
    }
}

/// Kind of vertical searched on an engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchType {
    #[default]
    Normal,
    Image,
    Video,
    News,
}

impl SearchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchType::Normal => "normal",
            SearchType::Image => "image",
            SearchType::Video => "video",
            SearchType::News => "news",
        }
    }
}

impl fmt::Display for SearchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SearchType {
    type Err = ScrapeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "normal" => Ok(SearchType::Normal),
            "image" => Ok(SearchType::Image),
            "video" => Ok(SearchType::Video),
            "news" => Ok(SearchType::News),
            other => Err(ScrapeError::Config(format!(
                "search_type must be one of normal, image, video, news (got '{}')",
                other
            ))),
        }
    }
}

/// Placeholder in a constant parameter value that is replaced by the query.
pub const QUERY_PLACEHOLDER: &str = "{query}";

/// How the result offset for pages after the first is expressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageRule {
    /// `first + (page - 1) * step`.
    Offset { first: u32, step: PageStep },
    /// `page - 1`.
    ZeroIndexed,
    /// `page`.
    OneIndexed,
}

/// Step size of an offset rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageStep {
    Fixed(u32),
    ResultsPerPage,
}

/// The parameter carrying the page position. Omitted on page one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageParam {
    pub name: &'static str,
    pub rule: PageRule,
}

impl PageParam {
    fn value(&self, page: u32, results_per_page: u32) -> u32 {
        let page = page.max(1);
        match self.rule {
            PageRule::Offset { first, step } => {
                let step = match step {
                    PageStep::Fixed(n) => n,
                    PageStep::ResultsPerPage => results_per_page,
                };
                first + (page - 1) * step
            }
            PageRule::ZeroIndexed => page - 1,
            PageRule::OneIndexed => page,
        }
    }
}

/// Marks that reveal a blocking page ("unusual traffic").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DenialNeedles {
    /// Substring of the current URL.
    pub in_url: &'static str,
    /// Substring of the page HTML.
    pub in_html: &'static str,
}

impl DenialNeedles {
    pub fn matches(&self, url: &str, html: &str) -> bool {
        (!self.in_url.is_empty() && url.contains(self.in_url))
            || (!self.in_html.is_empty() && html.contains(self.in_html))
    }
}

/// Static description of one engine.
#[derive(Debug)]
pub struct EngineProfile {
    pub engine: SearchEngine,
    pub name: &'static str,
    /// Base search URL (ends with `?` when parameters are appended).
    pub search_url: &'static str,
    /// Base URL for the HTTP transports when it differs from `search_url`.
    pub http_search_url: Option<&'static str>,
    /// Constant GET parameters sent with every query.
    pub fixed_params: &'static [(&'static str, &'static str)],
    pub query_param: &'static str,
    pub page_param: Option<PageParam>,
    /// Sent only when the requested page size differs from 10.
    pub results_per_page_param: Option<&'static str>,
    pub image_params: &'static [(&'static str, &'static str)],
    pub video_params: &'static [(&'static str, &'static str)],
    pub news_params: &'static [(&'static str, &'static str)],
    /// Browser landing page for normal searches.
    pub landing_url: &'static str,
    /// Browser landing page for image searches.
    pub image_landing_url: Option<&'static str>,
    /// `name` attribute of the search input element.
    pub input_field: &'static str,
    /// Element that leads to the next result page. `None` means scroll.
    pub next_page_selector: Option<&'static str>,
    /// Element visible once a result page has rendered.
    pub results_ready_selector: Option<&'static str>,
    /// The engine echoes the query in the result URL; wait on that instead.
    pub query_in_url: bool,
    /// Text shown when a scrolling engine has nothing more to load.
    pub exhausted_marker: Option<&'static str>,
    pub denial: Option<DenialNeedles>,
}

impl EngineProfile {
    /// Base URL identifying this engine for the given transport.
    pub fn base_url(&self, http: bool) -> &'static str {
        if http {
            self.http_search_url.unwrap_or(self.search_url)
        } else {
            self.search_url
        }
    }

    /// GET parameters for one result page.
    pub fn search_params(
        &self,
        query: &str,
        page: u32,
        results_per_page: u32,
        search_type: SearchType,
    ) -> Vec<(String, String)> {
        let mut params: Vec<(String, String)> = self
            .fixed_params
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        params.push((self.query_param.to_string(), query.to_string()));

        if let Some(name) = self.results_per_page_param {
            if results_per_page != 10 {
                params.push((name.to_string(), results_per_page.to_string()));
            }
        }
        if let Some(page_param) = self.page_param {
            if page > 1 {
                params.push((
                    page_param.name.to_string(),
                    page_param.value(page, results_per_page).to_string(),
                ));
            }
        }

        let extra = match search_type {
            SearchType::Normal => &[][..],
            SearchType::Image => self.image_params,
            SearchType::Video => self.video_params,
            SearchType::News => self.news_params,
        };
        for (k, v) in extra {
            let value = if *v == QUERY_PLACEHOLDER {
                query.to_string()
            } else {
                v.to_string()
            };
            params.push((k.to_string(), value));
        }
        params
    }

    /// Full GET URL for one result page on the HTTP transports.
    pub fn search_url_for(
        &self,
        query: &str,
        page: u32,
        results_per_page: u32,
        search_type: SearchType,
    ) -> String {
        let encoded = self
            .search_params(query, page, results_per_page, search_type)
            .iter()
            .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&");
        format!("{}{}", self.base_url(true), encoded)
    }

    /// Browser landing page for the search type, if the engine has one.
    pub fn landing_url_for(&self, search_type: SearchType) -> Option<&'static str> {
        match search_type {
            SearchType::Image => self.image_landing_url,
            _ => Some(self.landing_url),
        }
    }
}

static GOOGLE: EngineProfile = EngineProfile {
    engine: SearchEngine::Google,
    name: "google",
    search_url: "https://www.google.com/search?",
    http_search_url: None,
    fixed_params: &[("hl", "en")],
    query_param: "q",
    page_param: Some(PageParam {
        name: "start",
        rule: PageRule::Offset { first: 0, step: PageStep::ResultsPerPage },
    }),
    results_per_page_param: Some("num"),
    image_params: &[
        ("oq", QUERY_PLACEHOLDER),
        ("site", "imghp"),
        ("tbm", "isch"),
        ("source", "hp"),
        ("biw", "1920"),
        ("bih", "881"),
    ],
    video_params: &[
        ("tbm", "vid"),
        ("source", "lnms"),
        ("sa", "X"),
        ("biw", "1920"),
        ("bih", "881"),
    ],
    news_params: &[("tbm", "nws"), ("source", "lnms"), ("sa", "X")],
    landing_url: "https://www.google.com/",
    image_landing_url: Some("https://www.google.com/imghp"),
    input_field: "q",
    next_page_selector: Some("#pnnext"),
    results_ready_selector: Some("#navcnt td.cur"),
    query_in_url: false,
    exhausted_marker: None,
    denial: Some(DenialNeedles {
        in_url: "/sorry/",
        in_html: "detected unusual traffic",
    }),
};

static YANDEX: EngineProfile = EngineProfile {
    engine: SearchEngine::Yandex,
    name: "yandex",
    search_url: "http://yandex.ru/yandsearch?",
    http_search_url: None,
    fixed_params: &[],
    query_param: "text",
    page_param: Some(PageParam { name: "p", rule: PageRule::ZeroIndexed }),
    results_per_page_param: None,
    image_params: &[],
    video_params: &[],
    news_params: &[],
    landing_url: "http://www.yandex.ru/",
    image_landing_url: Some("http://yandex.ru/images/"),
    input_field: "text",
    next_page_selector: Some(".pager__button_kind_next"),
    results_ready_selector: Some(".pager__item_current_yes"),
    query_in_url: false,
    exhausted_marker: None,
    denial: None,
};

static BING: EngineProfile = EngineProfile {
    engine: SearchEngine::Bing,
    name: "bing",
    search_url: "http://www.bing.com/search?",
    http_search_url: None,
    fixed_params: &[],
    query_param: "q",
    page_param: Some(PageParam {
        name: "first",
        rule: PageRule::Offset { first: 1, step: PageStep::Fixed(10) },
    }),
    results_per_page_param: None,
    image_params: &[],
    video_params: &[],
    news_params: &[],
    landing_url: "http://www.bing.com/",
    image_landing_url: Some("https://www.bing.com/?scope=images"),
    input_field: "q",
    next_page_selector: Some(".sb_pagN"),
    results_ready_selector: Some("nav li a.sb_pagS"),
    query_in_url: false,
    exhausted_marker: None,
    denial: None,
};

static YAHOO: EngineProfile = EngineProfile {
    engine: SearchEngine::Yahoo,
    name: "yahoo",
    search_url: "https://de.search.yahoo.com/search?",
    http_search_url: None,
    fixed_params: &[("ei", "UTF-8")],
    query_param: "p",
    page_param: Some(PageParam {
        name: "b",
        rule: PageRule::Offset { first: 1, step: PageStep::Fixed(10) },
    }),
    results_per_page_param: None,
    image_params: &[],
    video_params: &[],
    news_params: &[],
    landing_url: "https://yahoo.com/",
    image_landing_url: Some("http://images.yahoo.com/"),
    input_field: "p",
    next_page_selector: Some("#pg-next"),
    results_ready_selector: Some(".compPagination strong"),
    query_in_url: false,
    exhausted_marker: None,
    denial: None,
};

static BAIDU: EngineProfile = EngineProfile {
    engine: SearchEngine::Baidu,
    name: "baidu",
    search_url: "http://www.baidu.com/s?",
    http_search_url: None,
    fixed_params: &[("ie", "utf-8")],
    query_param: "wd",
    page_param: Some(PageParam {
        name: "pn",
        rule: PageRule::Offset { first: 0, step: PageStep::Fixed(10) },
    }),
    results_per_page_param: None,
    image_params: &[],
    video_params: &[],
    news_params: &[],
    landing_url: "http://baidu.com/",
    image_landing_url: Some("http://image.baidu.com/"),
    input_field: "wd",
    next_page_selector: Some(".n"),
    results_ready_selector: Some("#page .fk_cur + .pc"),
    query_in_url: false,
    exhausted_marker: None,
    denial: None,
};

static DUCKDUCKGO: EngineProfile = EngineProfile {
    engine: SearchEngine::DuckDuckGo,
    name: "duckduckgo",
    search_url: "https://duckduckgo.com/",
    http_search_url: Some("https://duckduckgo.com/html/?"),
    fixed_params: &[],
    query_param: "q",
    page_param: None,
    results_per_page_param: None,
    image_params: &[],
    video_params: &[],
    news_params: &[],
    landing_url: "https://duckduckgo.com/",
    image_landing_url: None,
    input_field: "q",
    next_page_selector: None,
    results_ready_selector: None,
    query_in_url: false,
    exhausted_marker: Some("No more results"),
    denial: None,
};

static ASK: EngineProfile = EngineProfile {
    engine: SearchEngine::Ask,
    name: "ask",
    search_url: "http://de.ask.com/web?",
    http_search_url: None,
    fixed_params: &[("qsrc", "0"), ("l", "dir"), ("qo", "homepageSearchBox")],
    query_param: "q",
    page_param: Some(PageParam { name: "page", rule: PageRule::OneIndexed }),
    results_per_page_param: None,
    image_params: &[],
    video_params: &[],
    news_params: &[],
    landing_url: "http://ask.com/",
    image_landing_url: Some("http://www.ask.com/pictures/"),
    input_field: "q",
    next_page_selector: Some("#paging div a.txt3.l_nu"),
    results_ready_selector: Some("#paging .pgcsel .pg"),
    query_in_url: true,
    exhausted_marker: None,
    denial: None,
};

#[cfg(test)]
mod tests {
    use super::*;

    fn param<'a>(params: &'a [(String, String)], name: &str) -> Option<&'a str> {
        params
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    #[test]
    fn test_engine_names_roundtrip() {
        for engine in SearchEngine::ALL {
            let parsed: SearchEngine = engine.name().parse().unwrap();
            assert_eq!(parsed, engine);
            assert_eq!(engine.profile().engine, engine);
        }
    }

    #[test]
    fn test_unknown_engine() {
        let err = "altavista".parse::<SearchEngine>().unwrap_err();
        assert!(matches!(err, ScrapeError::UnknownEngine(name) if name == "altavista"));
    }

    #[test]
    fn test_parse_list_star_and_dedup() {
        assert_eq!(SearchEngine::parse_list("*").unwrap().len(), 7);
        let list = SearchEngine::parse_list("google, Bing,google").unwrap();
        assert_eq!(list, vec![SearchEngine::Google, SearchEngine::Bing]);
        assert!(SearchEngine::parse_list("google,lycos").is_err());
    }

    #[test]
    fn test_engine_serde_names() {
        let json = serde_json::to_string(&SearchEngine::DuckDuckGo).unwrap();
        assert_eq!(json, "\"duckduckgo\"");
        let engine: SearchEngine = serde_json::from_str("\"yandex\"").unwrap();
        assert_eq!(engine, SearchEngine::Yandex);
    }

    #[test]
    fn test_google_params_first_page() {
        let p = GOOGLE.search_params("rust", 1, 10, SearchType::Normal);
        assert_eq!(param(&p, "hl"), Some("en"));
        assert_eq!(param(&p, "q"), Some("rust"));
        assert_eq!(param(&p, "num"), None);
        assert_eq!(param(&p, "start"), None);
    }

    #[test]
    fn test_google_params_offset_uses_page_size() {
        let p = GOOGLE.search_params("rust", 3, 50, SearchType::Normal);
        assert_eq!(param(&p, "num"), Some("50"));
        assert_eq!(param(&p, "start"), Some("100"));
    }

    #[test]
    fn test_google_search_type_toggles() {
        let p = GOOGLE.search_params("cats", 1, 10, SearchType::Image);
        assert_eq!(param(&p, "tbm"), Some("isch"));
        assert_eq!(param(&p, "oq"), Some("cats"));
        let p = GOOGLE.search_params("cats", 1, 10, SearchType::Video);
        assert_eq!(param(&p, "tbm"), Some("vid"));
        let p = GOOGLE.search_params("cats", 1, 10, SearchType::News);
        assert_eq!(param(&p, "tbm"), Some("nws"));
        assert_eq!(param(&p, "biw"), None);
    }

    #[test]
    fn test_offset_params_per_engine() {
        let p = BING.search_params("q", 3, 10, SearchType::Normal);
        assert_eq!(param(&p, "first"), Some("21"));
        let p = YAHOO.search_params("q", 2, 10, SearchType::Normal);
        assert_eq!(param(&p, "b"), Some("11"));
        assert_eq!(param(&p, "ei"), Some("UTF-8"));
        let p = BAIDU.search_params("q", 4, 10, SearchType::Normal);
        assert_eq!(param(&p, "pn"), Some("30"));
        let p = YANDEX.search_params("q", 5, 10, SearchType::Normal);
        assert_eq!(param(&p, "p"), Some("4"));
        assert_eq!(param(&p, "text"), Some("q"));
        let p = ASK.search_params("q", 7, 10, SearchType::Normal);
        assert_eq!(param(&p, "page"), Some("7"));
        let p = DUCKDUCKGO.search_params("q", 2, 10, SearchType::Normal);
        assert_eq!(p, vec![("q".to_string(), "q".to_string())]);
    }

    #[test]
    fn test_page_param_omitted_on_first_page() {
        for engine in SearchEngine::ALL {
            let p = engine.profile().search_params("x", 1, 10, SearchType::Normal);
            if let Some(page_param) = engine.profile().page_param {
                assert_eq!(param(&p, page_param.name), None, "{}", engine);
            }
        }
    }

    #[test]
    fn test_base_url_by_transport() {
        assert_eq!(DUCKDUCKGO.base_url(true), "https://duckduckgo.com/html/?");
        assert_eq!(DUCKDUCKGO.base_url(false), "https://duckduckgo.com/");
        assert_eq!(GOOGLE.base_url(true), GOOGLE.base_url(false));
    }

    #[test]
    fn test_search_url_encodes_query() {
        let url = BING.search_url_for("rust lang & more", 1, 10, SearchType::Normal);
        assert_eq!(url, "http://www.bing.com/search?q=rust%20lang%20%26%20more");
    }

    #[test]
    fn test_landing_urls() {
        assert_eq!(
            GOOGLE.landing_url_for(SearchType::Image),
            Some("https://www.google.com/imghp")
        );
        assert_eq!(DUCKDUCKGO.landing_url_for(SearchType::Image), None);
        assert_eq!(
            DUCKDUCKGO.landing_url_for(SearchType::Normal),
            Some("https://duckduckgo.com/")
        );
    }

    #[test]
    fn test_denial_needles() {
        let needles = GOOGLE.denial.unwrap();
        assert!(needles.matches("https://www.google.com/sorry/index?continue=x", ""));
        assert!(needles.matches("https://www.google.com/search", "Our systems have detected unusual traffic"));
        assert!(!needles.matches("https://www.google.com/search?q=x", "<html>fine</html>"));
    }

    #[test]
    fn test_search_type_parse() {
        assert_eq!("Image".parse::<SearchType>().unwrap(), SearchType::Image);
        assert!("maps".parse::<SearchType>().unwrap_err().is_config());
    }
}
