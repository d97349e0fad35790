//! `pages` module: lets applications publish UI surfaces backed by their
//! public HTML files.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use marquee_core::event::Event;

use super::{script_error, ModuleDependencies, NativeModule, RhaiResult};

const VALID_PAGE_MIME_TYPES: [&str; 2] = ["text/html", "application/xhtml+xml"];

/// A published application page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageInfo {
    pub page_id: String,
    pub file_name: String,
    pub title: String,
}

struct PagesInner {
    application_id: String,
    application_version: i64,
    deps: ModuleDependencies,
    pages: Mutex<HashMap<String, PageInfo>>,
    on_page_unpublished: Event<String>,
}

impl PagesInner {
    fn unpublish(&self, page_id: &str) -> bool {
        let removed = self
            .pages
            .lock()
            .expect("pages poisoned")
            .remove(page_id)
            .is_some();
        if removed {
            self.on_page_unpublished.notify(page_id.to_string());
        }
        removed
    }
}

pub struct PagesModule {
    inner: Arc<PagesInner>,
}

impl PagesModule {
    pub fn new(
        application_id: String,
        application_version: i64,
        deps: ModuleDependencies,
    ) -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::new(PagesInner {
                application_id,
                application_version,
                deps,
                pages: Mutex::new(HashMap::new()),
                on_page_unpublished: Event::new(),
            }),
        })
    }

    /// Fired with the page id when a page is unpublished.
    pub fn on_page_unpublished(&self) -> &Event<String> {
        &self.inner.on_page_unpublished
    }

    pub fn resolve_page(&self, page_id: &str) -> Option<PageInfo> {
        self.inner
            .pages
            .lock()
            .expect("pages poisoned")
            .get(page_id)
            .cloned()
    }

    pub fn published_pages(&self) -> Vec<PageInfo> {
        self.inner
            .pages
            .lock()
            .expect("pages poisoned")
            .values()
            .cloned()
            .collect()
    }
}

impl NativeModule for PagesModule {
    fn name(&self) -> &'static str {
        "pages"
    }

    fn build(&self) -> rhai::Module {
        let mut module = rhai::Module::new();

        let inner = Arc::clone(&self.inner);
        module.set_native_fn(
            "publish_file",
            move |page_id: &str, file_name: &str, title: &str| {
                if page_id.is_empty() || file_name.is_empty() {
                    return Err(script_error("Missing argument"));
                }
                let file = inner
                    .deps
                    .runtime
                    .block_on(inner.deps.db.application_file(
                        &inner.application_id,
                        inner.application_version,
                        file_name,
                    ))
                    .map_err(|_| script_error(format!("File '{file_name}' not found")))?;
                if file.public == 0 {
                    return Err(script_error(format!("File '{file_name}' is not public")));
                }
                if !VALID_PAGE_MIME_TYPES.contains(&file.file_type.as_str()) {
                    return Err(script_error(format!("File '{file_name}' is not a page")));
                }
                inner.pages.lock().expect("pages poisoned").insert(
                    page_id.to_string(),
                    PageInfo {
                        page_id: page_id.to_string(),
                        file_name: file_name.to_string(),
                        title: title.to_string(),
                    },
                );
                Ok(())
            },
        );

        let inner = Arc::clone(&self.inner);
        module.set_native_fn("unpublish", move |page_id: &str| -> RhaiResult<bool> {
            Ok(inner.unpublish(page_id))
        });

        module
    }

    /// Pages do not survive a pause; the frontend must re-resolve them after
    /// the application resumes and republishes.
    fn execution_paused(&self) {
        let ids: Vec<String> = self
            .inner
            .pages
            .lock()
            .expect("pages poisoned")
            .keys()
            .cloned()
            .collect();
        for id in ids {
            self.inner.unpublish(&id);
        }
    }
}
