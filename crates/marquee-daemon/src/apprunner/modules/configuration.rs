//! `configuration` module: application overrides for process-wide
//! configurables (name, logo, favicon, sidebar tab).

use std::sync::{Arc, Mutex};

use marquee_core::event::{BufferingGuarantee, SubscriptionHandle};
use marquee_core::shutdown::ShutdownToken;
use uuid::Uuid;

use crate::configuration::{Configurable, ConfigurableValue, ConfigurationManager, SidebarTabData};

use super::pages::PagesModule;
use super::{script_error, ApplicationContext, ModuleDependencies, NativeModule};

struct ConfigurationInner {
    context: Arc<dyn ApplicationContext>,
    manager: Arc<ConfigurationManager>,
    pages: Arc<PagesModule>,
    deps: ModuleDependencies,
    current_sidebar_page_id: Mutex<String>,
}

impl ConfigurationInner {
    /// Referenced files must exist at this version, be public, and (for
    /// logo/favicon) be images.
    fn assert_file_available_publicly(
        &self,
        file_name: &str,
        must_be_image: bool,
    ) -> Result<(), Box<rhai::EvalAltResult>> {
        let file = self
            .deps
            .runtime
            .block_on(self.deps.db.application_file(
                &self.context.application_id(),
                self.context.application_version(),
                file_name,
            ))
            .map_err(|_| script_error(format!("File '{file_name}' not found")))?;
        if file.public == 0 {
            return Err(script_error(format!("File '{file_name}' is not public")));
        }
        if must_be_image && !file.file_type.starts_with("image/") {
            return Err(script_error("File is not an image"));
        }
        Ok(())
    }

    fn asset_url(&self, file_name: &str) -> String {
        format!(
            "/assets/app/{}/{}/{}",
            self.context.application_id(),
            self.context.application_version(),
            file_name
        )
    }

    fn set_text_configurable(
        &self,
        configurable: Configurable,
        value: &str,
    ) -> Result<bool, Box<rhai::EvalAltResult>> {
        let application_id = self.context.application_id();
        if value.is_empty() {
            self.manager.reset_configurable(configurable, &application_id);
            return Ok(true);
        }
        self.manager
            .set_configurable(
                configurable,
                &application_id,
                ConfigurableValue::Text(value.to_string()),
            )
            .map_err(|e| script_error(e.to_string()))
    }
}

pub struct ConfigurationModule {
    inner: Arc<ConfigurationInner>,
    unpublish_subscription: Mutex<Option<SubscriptionHandle>>,
}

impl ConfigurationModule {
    pub fn new(
        context: Arc<dyn ApplicationContext>,
        pages: Arc<PagesModule>,
        deps: ModuleDependencies,
    ) -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::new(ConfigurationInner {
                context,
                manager: Arc::clone(&deps.configuration),
                pages,
                deps,
                current_sidebar_page_id: Mutex::new(String::new()),
            }),
            unpublish_subscription: Mutex::new(None),
        })
    }
}

impl NativeModule for ConfigurationModule {
    fn name(&self) -> &'static str {
        "configuration"
    }

    fn build(&self) -> rhai::Module {
        let mut module = rhai::Module::new();

        let inner = Arc::clone(&self.inner);
        module.set_native_fn("set_app_name", move |name: &str| {
            inner.set_text_configurable(Configurable::ApplicationName, name)
        });

        let inner = Arc::clone(&self.inner);
        module.set_native_fn("set_app_logo", move |file_name: &str| {
            if file_name.is_empty() {
                return inner.set_text_configurable(Configurable::LogoUrl, "");
            }
            inner.assert_file_available_publicly(file_name, true)?;
            let url = inner.asset_url(file_name);
            inner.set_text_configurable(Configurable::LogoUrl, &url)
        });

        let inner = Arc::clone(&self.inner);
        module.set_native_fn("set_app_favicon", move |file_name: &str| {
            if file_name.is_empty() {
                return inner.set_text_configurable(Configurable::FaviconUrl, "");
            }
            inner.assert_file_available_publicly(file_name, true)?;
            let url = inner.asset_url(file_name);
            inner.set_text_configurable(Configurable::FaviconUrl, &url)
        });

        let inner = Arc::clone(&self.inner);
        module.set_native_fn("set_sidebar_tab", move |page_id: &str| {
            set_sidebar_tab(&inner, page_id, "")
        });

        let inner = Arc::clone(&self.inner);
        module.set_native_fn(
            "set_sidebar_tab",
            move |page_id: &str, before_tab_id: &str| set_sidebar_tab(&inner, page_id, before_tab_id),
        );

        module
    }

    fn execution_resumed(&self, _execution: &ShutdownToken) {
        let inner = Arc::clone(&self.inner);
        let subscription = self.inner.pages.on_page_unpublished().subscribe_using_callback(
            BufferingGuarantee::BufferAll,
            move |unpublished_page_id: String| {
                let current = inner
                    .current_sidebar_page_id
                    .lock()
                    .expect("sidebar state poisoned")
                    .clone();
                if unpublished_page_id == current && !current.is_empty() {
                    inner
                        .manager
                        .reset_configurable(Configurable::SidebarTabs, &inner.context.application_id());
                    inner
                        .current_sidebar_page_id
                        .lock()
                        .expect("sidebar state poisoned")
                        .clear();
                }
            },
        );
        *self
            .unpublish_subscription
            .lock()
            .expect("subscription poisoned") = Some(subscription);
    }

    fn execution_paused(&self) {
        self.unpublish_subscription
            .lock()
            .expect("subscription poisoned")
            .take();
        self.inner
            .manager
            .reset_all_for_application(&self.inner.context.application_id());
        self.inner
            .current_sidebar_page_id
            .lock()
            .expect("sidebar state poisoned")
            .clear();
    }
}

fn set_sidebar_tab(
    inner: &Arc<ConfigurationInner>,
    page_id: &str,
    before_tab_id: &str,
) -> Result<bool, Box<rhai::EvalAltResult>> {
    let application_id = inner.context.application_id();
    if page_id.is_empty() {
        inner
            .manager
            .reset_configurable(Configurable::SidebarTabs, &application_id);
        inner
            .current_sidebar_page_id
            .lock()
            .expect("sidebar state poisoned")
            .clear();
        return Ok(true);
    }

    let Some(info) = inner.pages.resolve_page(page_id) else {
        return Err(script_error(
            "First argument to set_sidebar_tab must be the ID of a published page",
        ));
    };

    let success = inner
        .manager
        .set_configurable(
            Configurable::SidebarTabs,
            &application_id,
            ConfigurableValue::SidebarTab(SidebarTabData {
                tab_id: Uuid::new_v4().to_string(),
                application_id: application_id.clone(),
                page_id: page_id.to_string(),
                title: info.title,
                before_tab_id: before_tab_id.to_string(),
            }),
        )
        .map_err(|e| script_error(e.to_string()))?;
    if success {
        *inner
            .current_sidebar_page_id
            .lock()
            .expect("sidebar state poisoned") = page_id.to_string();
    }
    Ok(success)
}
