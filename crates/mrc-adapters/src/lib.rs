//! Listing page adapter: fetch, heading-driven parse and description enrichment.

use std::collections::VecDeque;

use async_trait::async_trait;
use chrono::{Datelike, Month, NaiveDate};
use mrc_core::CandidateRecord;
use mrc_storage::{FetchError, HttpFetcher};
use scraper::{ElementRef, Html, Selector};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "mrc-adapters";

pub const DEFAULT_LISTING_URL_TEMPLATE: &str = "https://www.firstshowing.net/schedule{year}";

pub const DEFAULT_TMDB_BASE_URL: &str = "https://api.themoviedb.org/3";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("invalid selector `{selector}`: {message}")]
    Selector { selector: String, message: String },
}

/// Tag names and marker class describing the listing page structure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingMarkup {
    pub month_tag: String,
    pub day_tag: String,
    pub listing_tag: String,
    pub listing_class: String,
    pub emphasis_tag: String,
}

impl Default for ListingMarkup {
    fn default() -> Self {
        Self {
            month_tag: "h3".into(),
            day_tag: "h4".into(),
            listing_tag: "p".into(),
            listing_class: "sched".into(),
            emphasis_tag: "strong".into(),
        }
    }
}

impl ListingMarkup {
    pub fn compile(&self) -> Result<ListingSelectors, AdapterError> {
        let e = &self.emphasis_tag;
        Ok(ListingSelectors {
            markup: self.clone(),
            emphasis: parse_selector(e)?,
            anchor: parse_selector("a[href]")?,
            struck: parse_selector(&format!("{e} s, {e} strike, {e} del"))?,
        })
    }
}

fn parse_selector(selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector).map_err(|e| AdapterError::Selector {
        selector: selector.to_string(),
        message: e.to_string(),
    })
}

/// Compiled form of [`ListingMarkup`], built once per pipeline.
#[derive(Debug)]
pub struct ListingSelectors {
    markup: ListingMarkup,
    emphasis: Selector,
    anchor: Selector,
    struck: Selector,
}

#[derive(Debug, Clone)]
pub enum TagRole<'a> {
    Month(String),
    Day(String),
    Listing(ElementRef<'a>),
    Other,
}

impl ListingSelectors {
    pub fn classify<'a>(&self, element: ElementRef<'a>) -> TagRole<'a> {
        let name = element.value().name();
        if name == self.markup.listing_tag
            && element
                .value()
                .classes()
                .any(|c| c == self.markup.listing_class)
        {
            return TagRole::Listing(element);
        }
        if name == self.markup.day_tag {
            return match element.select(&self.emphasis).next() {
                Some(strong) => TagRole::Day(element_text(strong)),
                None => TagRole::Other,
            };
        }
        if name == self.markup.month_tag {
            return TagRole::Month(element_text(element));
        }
        TagRole::Other
    }

    /// Emphasized, non-struck links of one listing paragraph.
    pub fn candidates(&self, paragraph: ElementRef<'_>, date: NaiveDate) -> Vec<CandidateRecord> {
        let mut out = Vec::new();
        for anchor in paragraph.select(&self.anchor) {
            let Some(emphasis) = anchor.select(&self.emphasis).next() else {
                continue;
            };
            // text outside the emphasis is a format note such as "(IMAX)"
            let title = element_text(emphasis);
            if anchor.select(&self.struck).next().is_some() {
                debug!(%title, "skipping struck-through entry");
                continue;
            }
            let href = anchor.value().attr("href").unwrap_or_default().trim();
            if title.is_empty() || href.is_empty() {
                continue;
            }
            out.push(CandidateRecord {
                title,
                release_date: date,
                source_url: absolutize_link(href),
                description: String::new(),
            });
        }
        out
    }
}

fn element_text(element: ElementRef<'_>) -> String {
    element.text().collect::<String>().trim().to_string()
}

/// Rewrites protocol-relative links to https; anything else passes through.
pub fn absolutize_link(href: &str) -> String {
    let href = href.trim();
    if href.starts_with("//") {
        format!("https:{href}")
    } else {
        href.to_string()
    }
}

/// Running date context of the listing walk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParserState {
    pub current_month: Option<Month>,
    pub current_date: Option<NaiveDate>,
}

impl ParserState {
    pub fn on_month(self, heading: &str) -> Self {
        let current_month = heading
            .split_whitespace()
            .next()
            .and_then(|word| word.trim_end_matches([':', ',']).parse::<Month>().ok());
        Self {
            current_month,
            ..self
        }
    }

    /// Accepts `"<Month> <day>"` or a bare day number under the current month.
    /// Anything else leaves the walk without a date.
    pub fn on_day(self, emphasized: &str, year: i32) -> Self {
        let text = emphasized.trim();
        if let Ok(date) = NaiveDate::parse_from_str(&format!("{text}, {year}"), "%B %d, %Y") {
            return Self {
                current_month: u8::try_from(date.month())
                    .ok()
                    .and_then(|m| Month::try_from(m).ok()),
                current_date: Some(date),
            };
        }

        let current_date = text
            .parse::<u32>()
            .ok()
            .zip(self.current_month)
            .and_then(|(day, month)| NaiveDate::from_ymd_opt(year, month.number_from_month(), day));
        Self {
            current_date,
            ..self
        }
    }
}

/// Single pass over a listing document, yielding candidates in document order.
pub struct ListingParser<'a> {
    tags: Box<dyn Iterator<Item = ElementRef<'a>> + 'a>,
    selectors: &'a ListingSelectors,
    state: ParserState,
    pending: VecDeque<CandidateRecord>,
    year: i32,
}

pub fn parse_listing<'a>(
    document: &'a Html,
    year: i32,
    selectors: &'a ListingSelectors,
) -> ListingParser<'a> {
    let tags = document
        .root_element()
        .descendants()
        .filter_map(ElementRef::wrap);
    ListingParser {
        tags: Box::new(tags),
        selectors,
        state: ParserState::default(),
        pending: VecDeque::new(),
        year,
    }
}

impl ListingParser<'_> {
    pub fn state(&self) -> ParserState {
        self.state
    }
}

impl Iterator for ListingParser<'_> {
    type Item = CandidateRecord;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(candidate) = self.pending.pop_front() {
                return Some(candidate);
            }
            let element = self.tags.next()?;
            match self.selectors.classify(element) {
                TagRole::Month(text) => self.state = self.state.on_month(&text),
                TagRole::Day(text) => {
                    self.state = self.state.on_day(&text, self.year);
                    if self.state.current_date.is_none() {
                        debug!(heading = %text, year = self.year, "unrecognized date heading");
                    }
                }
                TagRole::Listing(paragraph) => {
                    if let Some(date) = self.state.current_date {
                        self.pending
                            .extend(self.selectors.candidates(paragraph, date));
                    }
                }
                TagRole::Other => {}
            }
        }
    }
}

/// Parses raw listing HTML to completion. The document is dropped before returning.
pub fn parse_listing_html(raw: &str, year: i32, selectors: &ListingSelectors) -> Vec<CandidateRecord> {
    let document = Html::parse_document(raw);
    parse_listing(&document, year, selectors).collect()
}

#[async_trait]
pub trait ListingFetcher: Send + Sync {
    fn listing_url(&self, year: i32) -> String;

    async fn fetch_listing(&self, year: i32) -> Result<String, FetchError>;
}

pub struct HttpListingFetcher {
    http: HttpFetcher,
    url_template: String,
}

impl HttpListingFetcher {
    pub fn new(http: HttpFetcher, url_template: impl Into<String>) -> Self {
        Self {
            http,
            url_template: url_template.into(),
        }
    }
}

#[async_trait]
impl ListingFetcher for HttpListingFetcher {
    fn listing_url(&self, year: i32) -> String {
        self.url_template.replace("{year}", &year.to_string())
    }

    async fn fetch_listing(&self, year: i32) -> Result<String, FetchError> {
        self.http.fetch_text(&self.listing_url(year)).await
    }
}

/// Synopsis and credits lookup. Never fails; unavailable data yields `""`.
#[async_trait]
pub trait DescriptionEnricher: Send + Sync {
    async fn describe(&self, title: &str, year: i32) -> String;
}

#[derive(Debug, Default)]
pub struct NoopEnricher;

#[async_trait]
impl DescriptionEnricher for NoopEnricher {
    async fn describe(&self, _title: &str, _year: i32) -> String {
        String::new()
    }
}

/// Stored description: the enrichment text followed by the trailer link.
pub fn listing_description(enrichment: &str, source_url: &str) -> String {
    let enrichment = enrichment.trim();
    if enrichment.is_empty() {
        format!("Trailer: {source_url}")
    } else {
        format!("{enrichment}\nTrailer: {source_url}")
    }
}

#[derive(Debug, Clone)]
pub struct TmdbConfig {
    pub base_url: String,
    pub bearer_token: String,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<SearchHit>,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    id: u64,
    #[serde(default)]
    overview: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct CreditsResponse {
    #[serde(default)]
    cast: Vec<CreditPerson>,
    #[serde(default)]
    crew: Vec<CreditPerson>,
}

#[derive(Debug, Deserialize)]
struct CreditPerson {
    name: String,
    #[serde(default)]
    job: Option<String>,
}

pub struct TmdbEnricher {
    client: reqwest::Client,
    config: TmdbConfig,
}

impl TmdbEnricher {
    const MAX_CAST: usize = 5;

    pub fn new(client: reqwest::Client, config: TmdbConfig) -> Self {
        Self { client, config }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: String,
        query: &[(&str, String)],
    ) -> Result<T, FetchError> {
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.config.bearer_token)
            .query(query)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url,
            });
        }
        Ok(resp.json::<T>().await?)
    }

    async fn search(&self, title: &str, year: i32) -> Result<Option<SearchHit>, FetchError> {
        let url = format!("{}/search/movie", self.config.base_url.trim_end_matches('/'));
        let query = [
            ("query", title.to_string()),
            ("include_adult", "false".to_string()),
            ("year", year.to_string()),
        ];
        let resp: SearchResponse = self.get_json(url, &query).await?;
        Ok(resp.results.into_iter().next())
    }

    async fn credits(&self, movie_id: u64) -> Result<CreditsResponse, FetchError> {
        let url = format!(
            "{}/movie/{movie_id}/credits",
            self.config.base_url.trim_end_matches('/')
        );
        self.get_json(url, &[]).await
    }
}

fn compose_enrichment(overview: &str, credits: &CreditsResponse) -> String {
    let cast = credits
        .cast
        .iter()
        .take(TmdbEnricher::MAX_CAST)
        .map(|p| p.name.as_str())
        .collect::<Vec<_>>();
    let directors = credits
        .crew
        .iter()
        .filter(|p| p.job.as_deref() == Some("Director"))
        .map(|p| p.name.as_str())
        .collect::<Vec<_>>();

    let mut parts = Vec::new();
    if !overview.is_empty() {
        parts.push(overview.to_string());
    }
    if !cast.is_empty() {
        parts.push(format!("Starring: {}.", cast.join(", ")));
    }
    if !directors.is_empty() {
        parts.push(format!("Directed by: {}.", directors.join(", ")));
    }
    parts.join(" ")
}

#[async_trait]
impl DescriptionEnricher for TmdbEnricher {
    async fn describe(&self, title: &str, year: i32) -> String {
        let hit = match self.search(title, year).await {
            Ok(Some(hit)) => hit,
            Ok(None) => return String::new(),
            Err(err) => {
                warn!(%title, year, error = %err, "tmdb search failed");
                return String::new();
            }
        };
        let overview = hit.overview.as_deref().unwrap_or_default().trim().to_string();
        match self.credits(hit.id).await {
            Ok(credits) => compose_enrichment(&overview, &credits),
            Err(err) => {
                warn!(%title, movie_id = hit.id, error = %err, "tmdb credits failed");
                overview
            }
        }
    }
}
