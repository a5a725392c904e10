//! Content transforms applied to cached pages before they are served.
//!
//! A transform must be idempotent: its output is written back to the local
//! cache marked `minified`, and the same page may be transformed again after
//! a revalidation replaces it.

use std::sync::Arc;

use crate::error::TransformError;

pub trait PageTransform: Send + Sync + 'static {
    fn transform(&self, html: &str) -> Result<String, TransformError>;
}

impl<F> PageTransform for F
where
    F: Fn(&str) -> Result<String, TransformError> + Send + Sync + 'static,
{
    fn transform(&self, html: &str) -> Result<String, TransformError> {
        self(html)
    }
}

/// Runs `transform` on the blocking pool so large pages do not stall the
/// request executor.
pub async fn run_blocking(
    transform: Arc<dyn PageTransform>,
    html: String,
) -> Result<String, TransformError> {
    tokio::task::spawn_blocking(move || transform.transform(&html))
        .await
        .map_err(|err| TransformError::Aborted(err.to_string()))?
}

#[cfg(feature = "minify")]
pub use self::minify::HtmlMinifier;

#[cfg(feature = "minify")]
mod minify {
    use std::cell::Cell;
    use std::rc::Rc;

    use lol_html::html_content::{ContentType, EndTag};
    use lol_html::{doc_comments, doc_text, element, rewrite_str, RewriteStrSettings};

    use super::PageTransform;
    use crate::error::TransformError;

    /// Elements whose text is whitespace-sensitive or not HTML.
    const RAW_TEXT_ELEMENTS: &str = "pre, textarea, script, style";

    /// Conservative HTML minifier.
    ///
    /// Drops comments and collapses whitespace runs in text to a single
    /// space. Text inside `pre`, `textarea`, `script` and `style` is left
    /// alone, as are conditional comments and Knockout containerless
    /// bindings (`<!-- ko ... -->`), which the storefront's templates rely on.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct HtmlMinifier;

    impl PageTransform for HtmlMinifier {
        fn transform(&self, html: &str) -> Result<String, TransformError> {
            minify(html)
        }
    }

    fn keep_comment(text: &str) -> bool {
        let text = text.trim_start();
        text.starts_with("[if")
            || text.starts_with("<![endif")
            || text.starts_with("ko ")
            || text.starts_with("/ko")
    }

    fn minify(html: &str) -> Result<String, TransformError> {
        let raw_depth = Rc::new(Cell::new(0usize));
        let in_space = Rc::new(Cell::new(false));

        let text_depth = Rc::clone(&raw_depth);
        let settings = RewriteStrSettings {
            element_content_handlers: vec![element!(RAW_TEXT_ELEMENTS, {
                let raw_depth = Rc::clone(&raw_depth);
                move |el| {
                    raw_depth.set(raw_depth.get() + 1);
                    match el.end_tag_handlers() {
                        Some(handlers) => {
                            let raw_depth = Rc::clone(&raw_depth);
                            let handler: lol_html::EndTagHandler<'static> =
                                Box::new(move |_end: &mut EndTag<'_>| {
                                    raw_depth.set(raw_depth.get().saturating_sub(1));
                                    Ok(())
                                });
                            handlers.push(handler);
                        }
                        None => raw_depth.set(raw_depth.get().saturating_sub(1)),
                    }
                    Ok(())
                }
            })],
            document_content_handlers: vec![
                doc_comments!(|comment| {
                    if !keep_comment(&comment.text()) {
                        comment.remove();
                    }
                    Ok(())
                }),
                doc_text!(move |chunk| {
                    if text_depth.get() == 0 {
                        let collapsed = collapse_whitespace(chunk.as_str(), &in_space);
                        if collapsed != chunk.as_str() {
                            chunk.replace(&collapsed, ContentType::Html);
                        }
                    }
                    if chunk.last_in_text_node() {
                        in_space.set(false);
                    }
                    Ok(())
                }),
            ],
            ..RewriteStrSettings::default()
        };

        rewrite_str(html, settings).map_err(|err| TransformError::Failed(err.to_string()))
    }

    /// Collapses HTML whitespace runs to one space. `in_space` carries the
    /// state across chunks of the same text node.
    fn collapse_whitespace(text: &str, in_space: &Cell<bool>) -> String {
        let mut out = String::with_capacity(text.len());
        let mut space = in_space.get();
        for ch in text.chars() {
            if matches!(ch, ' ' | '\t' | '\n' | '\r' | '\x0c') {
                if !space {
                    out.push(' ');
                }
                space = true;
            } else {
                out.push(ch);
                space = false;
            }
        }
        in_space.set(space);
        out
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn closures_are_transforms() {
        let upper: Arc<dyn PageTransform> =
            Arc::new(|html: &str| Ok::<_, TransformError>(html.to_uppercase()));
        let out = run_blocking(upper, "abc".to_string()).await.unwrap();
        assert_eq!(out, "ABC");
    }

    #[tokio::test]
    async fn transform_errors_propagate() {
        let failing: Arc<dyn PageTransform> =
            Arc::new(|_: &str| Err::<String, _>(TransformError::Failed("nope".into())));
        assert!(matches!(
            run_blocking(failing, String::new()).await,
            Err(TransformError::Failed(_))
        ));
    }
}
