use crate::config::SymbolConfig;

/// Maps a user-entered symbol ("gold", "xau/usd") onto the configured instrument name.
/// Unknown symbols are upper-cased and kept as they are.
pub fn normalize_symbol(raw: &str, symbols: &[SymbolConfig]) -> String {
    let needle = raw.trim().to_lowercase();

    for cfg in symbols {
        if cfg.symbol.to_lowercase() == needle {
            return cfg.symbol.clone();
        }
        for alias in &cfg.aliases {
            if alias.to_lowercase() == needle {
                return cfg.symbol.clone();
            }
        }
    }

    raw.trim().to_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aliases_resolve_to_the_configured_symbol() {
        let symbols = vec![SymbolConfig::default()];
        assert_eq!(normalize_symbol("gold", &symbols), "XAUUSD");
        assert_eq!(normalize_symbol(" xau/usd ", &symbols), "XAUUSD");
        assert_eq!(normalize_symbol("XAUUSD", &symbols), "XAUUSD");
        assert_eq!(normalize_symbol("eurusd", &symbols), "EURUSD");
    }
}
