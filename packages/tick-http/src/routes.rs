use mime::Mime;

use crate::{
    error::HttpResult,
    headers::Method,
    server::Exchange,
    transport::ByteStream,
};

/// A route handler. It receives the live exchange and may read the request
/// body and write the reply; if it writes nothing the server answers 404 on
/// its behalf.
pub type Handler<S> = Box<dyn FnMut(&mut Exchange<'_, S>) -> HttpResult<()>>;

/// What a matched route does. One variant per handler kind so the table
/// carries typed payloads instead of opaque context pointers.
pub enum RouteTarget<S: ByteStream> {
    /// Reply with a fixed string body.
    Text { content_type: Mime, body: String },
    /// Reply with fixed bytes.
    Bytes { content_type: Mime, body: Vec<u8> },
    /// Reply `301 Moved` with this `Location`.
    Redirect { location: String },
    /// Invoke a user callback.
    Handler(Handler<S>),
}

impl<S: ByteStream> RouteTarget<S> {
    pub fn handler<F>(f: F) -> Self
    where
        F: FnMut(&mut Exchange<'_, S>) -> HttpResult<()> + 'static,
    {
        RouteTarget::Handler(Box::new(f))
    }
}

pub(crate) struct RouteEntry<S: ByteStream> {
    pattern: String,
    method: Method,
    mime_filter: Option<Mime>,
    pub(crate) target: RouteTarget<S>,
}

struct RewriteRule {
    from: String,
    to: String,
}

/// Ordered route table with rewrite rules. First match wins, in insertion
/// order, for both rewrites and routes.
pub struct Router<S: ByteStream> {
    rewrites: Vec<RewriteRule>,
    entries: Vec<RouteEntry<S>>,
}

impl<S: ByteStream> Default for Router<S> {
    fn default() -> Self {
        Self {
            rewrites: Vec::new(),
            entries: Vec::new(),
        }
    }
}

impl<S: ByteStream> Router<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a route. Patterns are matched literally after path
    /// normalization, except that a trailing `*` matches any remainder.
    pub fn add(&mut self, pattern: &str, method: Method, target: RouteTarget<S>) {
        self.add_filtered(pattern, method, None, target);
    }

    /// Registers a route that additionally requires the request's `Accept`
    /// header to admit `mime`.
    pub fn add_with_mime(&mut self, pattern: &str, method: Method, mime: Mime, target: RouteTarget<S>) {
        self.add_filtered(pattern, method, Some(mime), target);
    }

    fn add_filtered(
        &mut self,
        pattern: &str,
        method: Method,
        mime_filter: Option<Mime>,
        target: RouteTarget<S>,
    ) {
        self.entries.push(RouteEntry {
            pattern: normalize(pattern),
            method,
            mime_filter,
            target,
        });
    }

    /// Registers a rewrite rule applied before route matching. The first
    /// matching rule replaces the whole path with `to`.
    pub fn add_rewrite(&mut self, from: &str, to: &str) {
        self.rewrites.push(RewriteRule {
            from: normalize(from),
            to: to.to_owned(),
        });
    }

    /// Normalizes and rewrites a request path into its routing form.
    pub fn routing_path(&self, path: &str) -> String {
        let normalized = normalize(path);
        for rule in &self.rewrites {
            if pattern_matches(&rule.from, &normalized) {
                return rule.to.clone();
            }
        }
        normalized
    }

    /// Finds the first entry matching the already-rewritten path. `accept`
    /// is the request's `Accept` header, if any.
    pub(crate) fn resolve(
        &mut self,
        path: &str,
        method: &Method,
        accept: Option<&str>,
    ) -> Option<&mut RouteEntry<S>> {
        self.entries.iter_mut().find(|entry| {
            entry.method == *method
                && pattern_matches(&entry.pattern, path)
                && accept_admits(entry.mime_filter.as_ref(), accept)
        })
    }
}

/// Collapses duplicate slashes; `//foo//bar/` becomes `/foo/bar/`.
pub(crate) fn normalize(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    let mut last_was_slash = false;
    for c in path.chars() {
        if c == '/' {
            if last_was_slash {
                continue;
            }
            last_was_slash = true;
        } else {
            last_was_slash = false;
        }
        out.push(c);
    }
    out
}

fn pattern_matches(pattern: &str, path: &str) -> bool {
    if let Some(prefix) = pattern.strip_suffix('*') {
        path.starts_with(prefix)
    } else {
        pattern == path
    }
}

/// A missing filter admits everything. A missing `Accept` header is treated
/// as `*/*`, and wildcard ranges in the header admit the filtered type.
fn accept_admits(filter: Option<&Mime>, accept: Option<&str>) -> bool {
    let Some(filter) = filter else {
        return true;
    };
    let Some(accept) = accept else {
        return true;
    };

    accept.split(',').any(|range| {
        let range = range.trim().split(';').next().unwrap_or("").trim();
        match range.parse::<Mime>() {
            Ok(range) => {
                (range.type_() == mime::STAR || range.type_() == filter.type_())
                    && (range.subtype() == mime::STAR || range.subtype() == filter.subtype())
            }
            Err(_) => false,
        }
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mock::MockStream;

    fn text(body: &str) -> RouteTarget<MockStream> {
        RouteTarget::Text {
            content_type: mime::TEXT_PLAIN,
            body: body.to_owned(),
        }
    }

    fn pattern_of(entry: &RouteEntry<MockStream>) -> &str {
        &entry.pattern
    }

    #[test]
    fn normalize_collapses_slashes() {
        assert_eq!(normalize("//foo//bar/"), "/foo/bar/");
        assert_eq!(normalize("/foo/bar"), "/foo/bar");
        assert_eq!(normalize("///"), "/");
    }

    #[test]
    fn first_match_wins() {
        let mut router: Router<MockStream> = Router::new();
        router.add("/a", Method::Get, text("one"));
        router.add("/*", Method::Get, text("two"));
        router.add("/a", Method::Get, text("three"));

        let entry = router.resolve("/a", &Method::Get, None).unwrap();
        assert_eq!(pattern_of(entry), "/a");
        match &entry.target {
            RouteTarget::Text { body, .. } => assert_eq!(body, "one"),
            _ => panic!("wrong target"),
        }
    }

    #[test]
    fn method_must_match() {
        let mut router: Router<MockStream> = Router::new();
        router.add("/a", Method::Get, text("x"));

        assert!(router.resolve("/a", &Method::Post, None).is_none());
        assert!(router.resolve("/a", &Method::Get, None).is_some());
    }

    #[test]
    fn wildcard_suffix_matches_remainder() {
        let mut router: Router<MockStream> = Router::new();
        router.add("/evt/*", Method::Notify, text("x"));

        assert!(router.resolve("/evt/12", &Method::Notify, None).is_some());
        assert!(router.resolve("/evt/", &Method::Notify, None).is_some());
        assert!(router.resolve("/other", &Method::Notify, None).is_none());
    }

    #[test]
    fn rewrites_apply_in_order_and_are_idempotent() {
        let mut router: Router<MockStream> = Router::new();
        router.add_rewrite("/x", "/y");
        router.add_rewrite("/y", "/y");

        assert_eq!(router.routing_path("/x"), "/y");
        let once = router.routing_path("//x");
        assert_eq!(router.routing_path(&once), once);
    }

    #[test]
    fn normalized_path_matches_clean_pattern() {
        let mut router: Router<MockStream> = Router::new();
        router.add("/foo/bar/", Method::Get, text("x"));

        let path = router.routing_path("//foo//bar/");
        assert!(router.resolve(&path, &Method::Get, None).is_some());
    }

    #[test]
    fn mime_filter_consults_accept() {
        let mut router: Router<MockStream> = Router::new();
        router.add_with_mime("/hello", Method::Get, mime::TEXT_PLAIN, text("hi"));

        assert!(router.resolve("/hello", &Method::Get, Some("*/*")).is_some());
        assert!(
            router
                .resolve("/hello", &Method::Get, Some("text/*"))
                .is_some()
        );
        assert!(
            router
                .resolve("/hello", &Method::Get, Some("text/plain; q=0.8"))
                .is_some()
        );
        assert!(
            router
                .resolve("/hello", &Method::Get, Some("application/xml"))
                .is_none()
        );
        assert!(router.resolve("/hello", &Method::Get, None).is_some());
    }
}
