//! Provider name normalization.
//!
//! Every external API spells streaming service names differently
//! ("Amazon Prime Video", "prime", "Apple TV+"). All cache keys, config
//! lookups, and verdict matching go through the canonical form produced here.

/// Canonicalizes a provider display name to the identifier used in
/// configuration and cache keys.
///
/// The result is lowercase, hyphen-separated, and stable: normalizing an
/// already-normalized name returns it unchanged.
pub fn normalize_provider_name(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return String::new();
    }

    if let Some(canonical) = special_case(trimmed) {
        return canonical.to_string();
    }

    // Generic fallback: lowercase, collapse runs of non-alphanumerics into
    // single hyphens, with '+' spelled out as "plus".
    let mut out = String::with_capacity(trimmed.len());
    let mut pending_hyphen = false;
    for ch in trimmed.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_hyphen && !out.is_empty() {
                out.push('-');
            }
            pending_hyphen = false;
            out.push(ch.to_ascii_lowercase());
        } else if ch == '+' {
            if !out.is_empty() {
                out.push_str("-plus");
            }
            pending_hyphen = false;
        } else {
            pending_hyphen = true;
        }
    }
    out
}

/// Known aliases that the generic rule would get wrong.
fn special_case(name: &str) -> Option<&'static str> {
    let folded: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_ascii_lowercase();

    let canonical = match folded.as_str() {
        "netflix" => "netflix",
        "amazonprimevideo" | "amazonprime" | "amazoninstantvideo" | "primevideo" | "prime"
        | "amazon" => "amazon-prime",
        "disneyplus" | "disney" => "disney-plus",
        "hbomax" | "hbo" | "max" => "hbo-max",
        "appletvplus" | "appletv" | "apple" => "apple-tv",
        "appleitunes" | "itunes" => "apple-itunes",
        "paramountplus" | "paramount" => "paramount-plus",
        "skygo" | "sky" => "sky-go",
        "googleplay" | "googleplaymovies" => "google-play",
        "microsoftstore" => "microsoft-store",
        _ => return None,
    };
    Some(canonical)
}
