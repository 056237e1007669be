use chrono::{DateTime, TimeZone};

const MAX_SLUG_LEN: usize = 50;

/// Reduce a free-form description to `[a-z0-9-]`, at most 50 characters,
/// with no leading, trailing or doubled dashes. May be empty.
pub fn slugify(description: &str) -> String {
    let mut slug = String::with_capacity(description.len());
    for c in description.chars().flat_map(char::to_lowercase) {
        let c = if c.is_ascii_lowercase() || c.is_ascii_digit() {
            c
        } else {
            '-'
        };
        if c == '-' && (slug.is_empty() || slug.ends_with('-')) {
            continue;
        }
        slug.push(c);
    }

    // all remaining characters are ASCII, so byte truncation is safe
    slug.truncate(MAX_SLUG_LEN);
    slug.trim_matches('-').to_string()
}

/// `<prefix>/<slug>-<YYYYMMDD-HHMMSS>`
pub fn branch_name<Tz>(prefix: &str, description: &str, at: DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: std::fmt::Display,
{
    format!(
        "{}/{}-{}",
        prefix,
        slugify(description),
        at.format("%Y%m%d-%H%M%S")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use proptest::prelude::*;
    use regex::Regex;

    #[test]
    fn slugifies_plain_descriptions() {
        assert_eq!(slugify("Invoice List Page"), "invoice-list-page");
        assert_eq!(slugify("  --Hello,   World!--  "), "hello-world");
        assert_eq!(slugify("Rapport för Q3"), "rapport-f-r-q3");
    }

    #[test]
    fn nothing_sluggable_leaves_an_empty_slug() {
        assert_eq!(slugify(""), "");
        assert_eq!(slugify("!!!"), "");
        assert_eq!(slugify("日本語"), "");

        let at = Utc.with_ymd_and_hms(2024, 3, 5, 14, 7, 9).unwrap();
        assert_eq!(branch_name("migration", "???", at), "migration/-20240305-140709");
    }

    #[test]
    fn long_descriptions_are_truncated_without_trailing_dash() {
        let description = format!("{} tail", "a".repeat(49));
        let slug = slugify(&description);
        assert_eq!(slug, "a".repeat(49));
    }

    #[test]
    fn branch_name_has_timestamp_suffix() {
        let at = Utc.with_ymd_and_hms(2024, 3, 5, 14, 7, 9).unwrap();
        assert_eq!(
            branch_name("figma-import", "Demo", at),
            "figma-import/demo-20240305-140709"
        );
    }

    proptest! {
        #[test]
        fn branch_names_are_well_formed(description in ".{0,120}") {
            let name = branch_name("migration", &description, Utc::now());
            let pattern = Regex::new(r"^migration/([a-z0-9-]{0,50})-\d{8}-\d{6}$").unwrap();
            let captures = pattern.captures(&name).expect("branch name shape");
            let slug = &captures[1];
            prop_assert!(!slug.starts_with('-'));
            prop_assert!(!slug.ends_with('-'));
            prop_assert!(!slug.contains("--"));
        }
    }
}
