//! Naming conventions for tables, keys and constraints.

use convert_case::{Case, Casing};

/// Unqualified type name with generic arguments stripped.
pub fn short_type_name(full: &str) -> &str {
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

pub fn snake(name: &str) -> String {
    name.to_case(Case::Snake)
}

/// English plural of a snake-case word; only the last segment is inflected.
pub fn pluralize(word: &str) -> String {
    let (head, last) = match word.rfind('_') {
        Some(pos) => (&word[..=pos], &word[pos + 1..]),
        None => ("", word),
    };

    let plural = if last.ends_with('y')
        && !last.ends_with("ay")
        && !last.ends_with("ey")
        && !last.ends_with("oy")
        && !last.ends_with("uy")
    {
        format!("{}ies", &last[..last.len() - 1])
    } else if ["s", "x", "z", "ch", "sh"].iter().any(|s| last.ends_with(s)) {
        format!("{}es", last)
    } else {
        format!("{}s", last)
    };

    format!("{}{}", head, plural)
}

/// Table name derived from a type name: `BlogPost` -> `blog_posts`.
pub fn table_for_type(type_name: &str) -> String {
    pluralize(&snake(short_type_name(type_name)))
}

/// Default foreign key naming a type: `User` -> `user_id`.
pub fn foreign_key_for_type(type_name: &str) -> String {
    format!("{}_id", snake(short_type_name(type_name)))
}

/// Default foreign key for a belongs-to field: `role` -> `role_id`.
pub fn foreign_key_for_field(field: &str) -> String {
    format!("{}_id", snake(field))
}

/// Pivot table for two tables: sorted, joined with `_`.
pub fn pivot_table(a: &str, b: &str) -> String {
    let mut tables = [a, b];
    tables.sort_unstable();
    format!("{}_{}", tables[0], tables[1])
}

pub fn foreign_key_constraint(table: &str, column: &str) -> String {
    format!("fk_{}_{}", table, column)
}

pub fn unique_index(table: &str, column: &str) -> String {
    format!("{}_{}_unique", table, column)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_for_type() {
        assert_eq!(table_for_type("app::models::User"), "users");
        assert_eq!(table_for_type("BlogPost"), "blog_posts");
        assert_eq!(table_for_type("Category"), "categories");
        assert_eq!(table_for_type("Address"), "addresses");
        assert_eq!(table_for_type("Survey"), "surveys");
        assert_eq!(table_for_type("Wrapper<Inner>"), "wrappers");
    }

    #[test]
    fn test_key_names() {
        assert_eq!(foreign_key_for_type("crate::UserRole"), "user_role_id");
        assert_eq!(foreign_key_for_field("author"), "author_id");
        assert_eq!(pivot_table("users", "roles"), "roles_users");
        assert_eq!(pivot_table("posts", "tags"), "posts_tags");
        assert_eq!(foreign_key_constraint("users", "roleId"), "fk_users_roleId");
        assert_eq!(unique_index("users", "email"), "users_email_unique");
    }
}
