//! Deterministic physical-name derivation.
//!
//! Every physical name is a pure function of declared names, so compiling
//! the same model set always yields the same schema.

/// Prefix applied to the inverse column of a self-referencing pivot, where
/// both foreign keys would otherwise collide on the same name.
pub const INVERSE_PREFIX: &str = "inv_";

/// Convert a declared name to snake_case.
pub fn snake_case(input: &str) -> String {
    let mut out = String::with_capacity(input.len() + 4);
    let mut prev_lower = false;
    for ch in input.chars() {
        if ch.is_uppercase() {
            if prev_lower {
                out.push('_');
            }
            for low in ch.to_lowercase() {
                out.push(low);
            }
            prev_lower = false;
        } else if ch == '-' || ch == ' ' || ch == '.' {
            out.push('_');
            prev_lower = false;
        } else {
            out.push(ch);
            prev_lower = ch.is_lowercase() || ch.is_ascii_digit();
        }
    }
    out
}

/// Column name for a scalar attribute.
pub fn column_name(attribute: &str) -> String {
    snake_case(attribute)
}

/// Foreign-key column name for a relation attribute (`{attr}_id`).
pub fn join_column_name(attribute: &str) -> String {
    format!("{}_id", snake_case(attribute))
}

/// Foreign-key column name inside a pivot, derived from a singular model
/// name (`{singular}_id`).
pub fn pivot_column_name(singular: &str) -> String {
    format!("{}_id", snake_case(singular))
}

/// Pivot table name for a relation (`{owner_table}_{attr}_links`).
pub fn join_table_name(owner_table: &str, attribute: &str) -> String {
    format!("{}_{}_links", owner_table, snake_case(attribute))
}

/// Pivot table name for embedded components (`{owner_table}_cmps`).
pub fn component_table_name(owner_table: &str) -> String {
    format!("{owner_table}_cmps")
}

/// Shared polymorphic pivot table name (`{owner_table}_morphs`).
pub fn morph_table_name(owner_table: &str) -> String {
    format!("{owner_table}_morphs")
}

/// Order column name, derived from a singular model name
/// (`{singular}_order`).
pub fn order_column_name(singular: &str) -> String {
    format!("{}_order", snake_case(singular))
}

/// Default table name for a model (`{singular}s`).
pub fn table_name(singular: &str) -> String {
    format!("{}s", snake_case(singular))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snake_case() {
        assert_eq!(snake_case("publishedAt"), "published_at");
        assert_eq!(snake_case("Title"), "title");
        assert_eq!(snake_case("related-items"), "related_items");
        assert_eq!(snake_case("already_snake"), "already_snake");
    }

    #[test]
    fn test_join_table_name_matches_scenario() {
        assert_eq!(join_table_name("articles", "tags"), "articles_tags_links");
    }

    #[test]
    fn test_derived_column_names() {
        assert_eq!(join_column_name("author"), "author_id");
        assert_eq!(pivot_column_name("article"), "article_id");
        assert_eq!(order_column_name("tag"), "tag_order");
        assert_eq!(component_table_name("articles"), "articles_cmps");
        assert_eq!(morph_table_name("articles"), "articles_morphs");
    }
}
