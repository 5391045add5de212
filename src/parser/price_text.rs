// Recognized text -> price. The candidate cascade is an explicit, ordered table.
use crate::config::{PriceBand, SymbolConfig};
use regex::Regex;

/// How the digits captured by a pattern are turned into a number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NumberStyle {
    Plain,
    /// "3,061.25": commas are thousands separators.
    Grouped,
    /// "65,48" may be a decimal comma.
    Loose,
}

pub struct PricePattern {
    pub name: &'static str,
    pub priority: u8,
    regex: Regex,
    style: NumberStyle,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub value: f64,
    pub pattern: &'static str,
    pub priority: u8,
}

pub trait Parser {
    fn extract(&self, text: &str, reference: Option<f64>) -> Option<f64>;
}

pub struct PriceTextExtractor {
    patterns: Vec<PricePattern>,
    band: PriceBand,
    narrow_band: Option<PriceBand>,
    fragment_band: PriceBand,
    base_price: Option<f64>,
    sanity_floor: f64,
}

impl PriceTextExtractor {
    pub fn new(cfg: &SymbolConfig) -> Result<Self, regex::Error> {
        let mut table: Vec<(&'static str, String, NumberStyle)> = Vec::new();

        let aliases: Vec<String> = std::iter::once(&cfg.symbol)
            .chain(cfg.aliases.iter())
            .filter(|a| !a.trim().is_empty())
            .map(|a| regex::escape(a.trim()))
            .collect();
        if !aliases.is_empty() {
            table.push((
                "symbol-anchored",
                format!(
                    r"(?i)(?:{})\D{{0,12}}?(\d{{1,2}},?\d{{3}}\.\d{{1,2}}|\d{{4}}\.\d{{1,2}})\b",
                    aliases.join("|")
                ),
                NumberStyle::Grouped,
            ));
        }
        table.push((
            "grouped-thousands",
            r"\b(\d{1,2},\d{3}\.\d{1,2})\b".to_string(),
            NumberStyle::Grouped,
        ));
        table.push((
            "four-digit-decimal",
            r"\b(\d{4}\.\d{1,2})\b".to_string(),
            NumberStyle::Plain,
        ));
        table.push((
            "decimal-comma",
            r"\b(\d{2,4},\d{1,2})\b".to_string(),
            NumberStyle::Loose,
        ));
        table.push((
            "any-decimal",
            r"(\d+(?:\.\d+)?)".to_string(),
            NumberStyle::Plain,
        ));

        let patterns = table
            .into_iter()
            .enumerate()
            .map(|(i, (name, source, style))| {
                Ok(PricePattern {
                    name,
                    priority: i as u8,
                    regex: Regex::new(&source)?,
                    style,
                })
            })
            .collect::<Result<Vec<_>, regex::Error>>()?;

        Ok(Self {
            patterns,
            band: cfg.band(),
            narrow_band: cfg.narrow_band,
            fragment_band: cfg.fragment_band,
            base_price: cfg.base_price,
            sanity_floor: cfg.sanity_floor,
        })
    }

    pub fn band(&self) -> PriceBand {
        self.band
    }

    pub fn patterns(&self) -> &[PricePattern] {
        &self.patterns
    }

    /// Every match of every pattern, most specific pattern first, duplicates dropped.
    pub fn candidates(&self, text: &str) -> Vec<Candidate> {
        let mut pool: Vec<Candidate> = Vec::new();

        for pattern in &self.patterns {
            for caps in pattern.regex.captures_iter(text) {
                let Some(raw) = caps.get(1) else { continue };
                let Some(value) = parse_number(raw.as_str(), pattern.style) else {
                    continue;
                };
                if pool.iter().any(|c| (c.value - value).abs() < 1e-9) {
                    continue;
                }
                pool.push(Candidate {
                    value,
                    pattern: pattern.name,
                    priority: pattern.priority,
                });
            }
        }

        pool
    }

    /// Picks one candidate from the pool; `None` means "nothing this cycle".
    pub fn select(&self, pool: &[Candidate], reference: Option<f64>) -> Option<f64> {
        if let Some(narrow) = self.narrow_band {
            if let Some(c) = pool.iter().find(|c| narrow.contains(c.value)) {
                return Some(c.value);
            }
        }

        let mut full = pool.iter().filter(|c| self.band.contains(c.value));
        let closest = match reference {
            Some(r) => full.min_by(|a, b| (a.value - r).abs().total_cmp(&(b.value - r).abs())),
            None => full.next(),
        };
        if let Some(c) = closest {
            return Some(c.value);
        }

        let base = reference
            .map(|r| (r / 100.0).floor() * 100.0)
            .or(self.base_price);
        if let Some(base) = base {
            for c in pool.iter().filter(|c| self.fragment_band.contains(c.value)) {
                let rebuilt = base + c.value;
                if self.band.contains(rebuilt) {
                    return Some((rebuilt * 100.0).round() / 100.0);
                }
            }
        }

        pool.iter()
            .find(|c| c.value > self.sanity_floor)
            .map(|c| c.value)
    }
}

impl Parser for PriceTextExtractor {
    fn extract(&self, text: &str, reference: Option<f64>) -> Option<f64> {
        let pool = self.candidates(text);
        self.select(&pool, reference)
    }
}

fn parse_number(raw: &str, style: NumberStyle) -> Option<f64> {
    let cleaned = match style {
        NumberStyle::Plain => raw.to_string(),
        NumberStyle::Grouped => raw.replace(',', ""),
        NumberStyle::Loose => raw.replace(',', "."),
    };
    cleaned.parse::<f64>().ok().filter(|v| v.is_finite())
}
