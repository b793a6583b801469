//! Small HTML rewrites applied to rendered certificates.

use std::{cell::Cell, rc::Rc};

use lol_html::html_content::ContentType;
use lol_html::{element, rewrite_str, RewriteStrSettings};

/// Inserts `fragment` as the first child of `<head>`.
///
/// Documents without a `<head>` element get the fragment prepended to the
/// whole document instead.
pub(crate) fn prepend_to_head(html: &str, fragment: &str) -> Result<String, String> {
    let injected = Rc::new(Cell::new(false));

    let rewritten = rewrite_str(
        html,
        RewriteStrSettings {
            element_content_handlers: vec![element!("head", {
                let injected = Rc::clone(&injected);
                move |el| {
                    if !injected.get() {
                        el.prepend(fragment, ContentType::Html);
                        injected.set(true);
                    }
                    Ok(())
                }
            })],
            ..RewriteStrSettings::default()
        },
    )
    .map_err(|err| err.to_string())?;

    if injected.get() {
        Ok(rewritten)
    } else {
        Ok(format!("{fragment}{rewritten}"))
    }
}
