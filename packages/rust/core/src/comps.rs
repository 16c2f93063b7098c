//! Comparable sales post-processing.
//!
//! Raw sales from the collaborator are deduplicated by normalized address,
//! filtered for recency relative to the valuation date, stripped of the
//! subject property, ranked by relevance and cut to the requested count.
//! Everything here is deterministic.

use std::collections::{BTreeSet, HashMap};
use std::sync::LazyLock;

use chrono::{Datelike, NaiveDate};
use regex::Regex;

use appraisal_shared::{ComparableSale, ComparablesSection};

/// Confidence ceiling for a sale merged from several sources.
const MULTI_SOURCE_CAP: f64 = 0.95;
/// Boost per extra contributing source.
const MULTI_SOURCE_BOOST: f64 = 0.1;
/// Confidence ceiling when the sale date cannot be parsed.
const UNPARSEABLE_DATE_CAP: f64 = 0.4;
/// Confidence ceiling when the sale date is missing.
const MISSING_DATE_CAP: f64 = 0.3;

/// Subject facts used for ranking.
#[derive(Debug, Clone)]
pub struct Subject<'a> {
    pub address: &'a str,
    pub property_type: &'a str,
    pub city: &'a str,
    pub county: Option<&'a str>,
    pub valuation_date: NaiveDate,
    pub size_sqft: Option<f64>,
    pub year_built: Option<i32>,
}

/// Knobs for [`process`].
#[derive(Debug, Clone, Copy)]
pub struct CompParams {
    pub years_back: u32,
    pub limit: usize,
}

// ---------------------------------------------------------------------------
// Address normalization
// ---------------------------------------------------------------------------

/// Canonical form used to detect duplicate addresses.
pub fn normalize_address(address: &str) -> String {
    static SEPARATORS: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"[.,#/-]").expect("valid regex"));
    static STREET_TYPES: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(
            r"\b(street|st|avenue|ave|road|rd|boulevard|blvd|drive|dr|lane|ln|way|place|pl|court|ct|parkway|pkwy)\b",
        )
        .expect("valid regex")
    });

    let lower = address.to_lowercase();
    let spaced = SEPARATORS.replace_all(&lower, " ");
    let stripped = STREET_TYPES.replace_all(&spaced, "");
    stripped.chars().filter(|c| !c.is_whitespace()).collect()
}

fn primary_source(source: &str) -> &str {
    source.split(" - ").next().unwrap_or(source)
}

fn populated_fields(sale: &ComparableSale) -> usize {
    [
        sale.address.is_some(),
        sale.sale_date.is_some(),
        sale.sale_price.is_some(),
        sale.building_size_sqft.is_some(),
        sale.year_built.is_some(),
        sale.property_type.is_some(),
    ]
    .into_iter()
    .filter(|p| *p)
    .count()
}

fn parse_sale_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").ok()
}

// ---------------------------------------------------------------------------
// Pipeline steps
// ---------------------------------------------------------------------------

/// Merge sales that share a normalized address.
///
/// The most confident (then most complete) entry absorbs missing fields from
/// the others. When several sources contributed, the source becomes
/// `Multiple Sources - a, b` and confidence is boosted. Sales without an
/// address are dropped. Group order follows first appearance.
pub fn dedup_and_enhance(sales: Vec<ComparableSale>) -> Vec<ComparableSale> {
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<ComparableSale>> = HashMap::new();

    for sale in sales {
        let key = sale
            .address
            .as_deref()
            .map(normalize_address)
            .unwrap_or_default();
        if key.is_empty() {
            continue;
        }
        groups
            .entry(key.clone())
            .or_insert_with(|| {
                order.push(key);
                Vec::new()
            })
            .push(sale);
    }

    let mut merged = Vec::with_capacity(order.len());
    for key in order {
        let Some(mut group) = groups.remove(&key) else {
            continue;
        };
        group.sort_by(|a, b| {
            b.confidence
                .total_cmp(&a.confidence)
                .then_with(|| populated_fields(b).cmp(&populated_fields(a)))
        });

        let mut iter = group.into_iter();
        let Some(mut base) = iter.next() else {
            continue;
        };
        let mut sources = BTreeSet::from([primary_source(&base.source).to_string()]);

        for other in iter {
            sources.insert(primary_source(&other.source).to_string());
            base.sale_date = base.sale_date.or(other.sale_date);
            base.sale_price = base.sale_price.or(other.sale_price);
            base.building_size_sqft = base.building_size_sqft.or(other.building_size_sqft);
            base.year_built = base.year_built.or(other.year_built);
            base.property_type = base.property_type.or(other.property_type);
        }

        if sources.len() > 1 {
            let extra = (sources.len() - 1) as f64;
            base.confidence = (base.confidence + MULTI_SOURCE_BOOST * extra).min(MULTI_SOURCE_CAP);
            base.source = format!(
                "Multiple Sources - {}",
                sources.into_iter().collect::<Vec<_>>().join(", ")
            );
        }
        merged.push(base);
    }
    merged
}

/// Keep sales from `years_back` calendar years before the valuation year on.
///
/// Undated or unparseable sales are kept with capped confidence.
pub fn filter_recent(
    sales: Vec<ComparableSale>,
    valuation_date: NaiveDate,
    years_back: u32,
) -> Vec<ComparableSale> {
    let cutoff_year = valuation_date.year() - years_back as i32;

    sales
        .into_iter()
        .filter_map(|mut sale| match sale.sale_date.as_deref().map(parse_sale_date) {
            Some(Some(date)) => (date.year() >= cutoff_year).then_some(sale),
            Some(None) => {
                sale.confidence = sale.confidence.min(UNPARSEABLE_DATE_CAP);
                Some(sale)
            }
            None => {
                sale.confidence = sale.confidence.min(MISSING_DATE_CAP);
                Some(sale)
            }
        })
        .collect()
}

/// Drop sales at the subject's own address.
pub fn remove_subject(sales: Vec<ComparableSale>, subject_address: &str) -> Vec<ComparableSale> {
    let subject = normalize_address(subject_address);
    if subject.is_empty() {
        return sales;
    }
    sales
        .into_iter()
        .filter(|s| s.address.as_deref().map(normalize_address).as_deref() != Some(subject.as_str()))
        .collect()
}

/// Relevance score: confidence, recency, size and age similarity.
pub fn relevance(sale: &ComparableSale, subject: &Subject<'_>, years_back: u32) -> f64 {
    let mut score = sale.confidence * 0.4;

    if let Some(date) = sale.sale_date.as_deref().and_then(parse_sale_date) {
        let days_ago = (subject.valuation_date - date).num_days() as f64;
        let horizon = f64::from(years_back.max(1)) * 365.0;
        let recency = (1.0 - days_ago / horizon).clamp(0.0, 1.0);
        score += recency * 0.3;
    }

    if let (Some(subject_size), Some(size)) = (subject.size_sqft, sale.building_size_sqft) {
        if subject_size > 0.0 && size > 0.0 {
            let diff_pct = (subject_size - size).abs() / subject_size;
            score += (1.0 - diff_pct * 2.0).max(0.0) * 0.15;
        }
    }

    if let (Some(subject_year), Some(year)) = (subject.year_built, sale.year_built) {
        if year > 1800 {
            let diff = f64::from((subject_year - year).abs());
            score += (1.0 - diff / 50.0).max(0.0) * 0.15;
        }
    }

    score
}

/// Stable sort by relevance, best first.
pub fn rank_by_relevance(
    mut sales: Vec<ComparableSale>,
    subject: &Subject<'_>,
    years_back: u32,
) -> Vec<ComparableSale> {
    sales.sort_by(|a, b| {
        relevance(b, subject, years_back).total_cmp(&relevance(a, subject, years_back))
    });
    sales
}

/// Format whole dollars with thousands separators.
fn format_usd(amount: f64) -> String {
    let digits = format!("{:.0}", amount.abs());
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    if amount < 0.0 {
        format!("-${grouped}")
    } else {
        format!("${grouped}")
    }
}

/// Human-readable description of the search.
pub fn summarize(
    subject: &Subject<'_>,
    years_back: u32,
    raw: &[ComparableSale],
    unique: &[ComparableSale],
    recent_count: usize,
    selected: &[ComparableSale],
) -> String {
    let mut parts = vec![
        format!(
            "Comparable sales search for {} in {}, {}.",
            subject.property_type,
            subject.city,
            subject.county.unwrap_or("N/A")
        ),
        format!("Initial search yielded {} raw entries.", raw.len()),
        format!(
            "After deduplication & enhancement: {} unique properties.",
            unique.len()
        ),
        format!("Filtered to {recent_count} properties from the last ~{years_back} years."),
    ];

    if selected.is_empty() {
        parts.push("No suitable comparable sales found matching all criteria.".into());
        return parts.join(" ");
    }

    parts.push(format!(
        "Selected top {} comparables based on relevance.",
        selected.len()
    ));

    let sources: BTreeSet<&str> = raw
        .iter()
        .chain(unique)
        .chain(selected)
        .map(|s| primary_source(&s.source))
        .filter(|s| !s.contains("Multiple Sources"))
        .collect();
    if sources.is_empty() {
        parts.push("No specific data sources were successfully identified in the final comps.".into());
    } else {
        parts.push(format!(
            "Data sources consulted include: {}.",
            sources.into_iter().collect::<Vec<_>>().join(", ")
        ));
    }

    let dates: Vec<NaiveDate> = selected
        .iter()
        .filter_map(|s| s.sale_date.as_deref().and_then(parse_sale_date))
        .collect();
    if let (Some(earliest), Some(latest)) = (dates.iter().min(), dates.iter().max()) {
        parts.push(format!(
            "Final selected sales range from {} to {}.",
            earliest.format("%b %Y"),
            latest.format("%b %Y")
        ));
    }

    let prices: Vec<f64> = selected.iter().filter_map(|s| s.sale_price).collect();
    if let (Some(min), Some(max)) = (
        prices.iter().copied().reduce(f64::min),
        prices.iter().copied().reduce(f64::max),
    ) {
        parts.push(format!(
            "Sale prices in final set range from {} to {}.",
            format_usd(min),
            format_usd(max)
        ));
    }

    parts.join(" ")
}

/// Run the full post-processing chain.
pub fn process(
    raw: Vec<ComparableSale>,
    subject: &Subject<'_>,
    params: CompParams,
) -> ComparablesSection {
    let unique = dedup_and_enhance(raw.clone());
    let recent = filter_recent(unique.clone(), subject.valuation_date, params.years_back);
    let recent_count = recent.len();
    let candidates = remove_subject(recent, subject.address);
    let mut ranked = rank_by_relevance(candidates, subject, params.years_back);
    ranked.truncate(params.limit);

    let summary = summarize(subject, params.years_back, &raw, &unique, recent_count, &ranked);
    ComparablesSection {
        raw_count: raw.len(),
        unique_count: unique.len(),
        recent_count,
        sales: ranked,
        summary,
    }
}
