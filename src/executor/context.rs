use std::collections::BTreeMap;

use serde_json::Value;

use crate::matching::{Frame, Point, TemplateMatcher};
use crate::sources::{NoScreen, ScreenSource};

/// A template image plus the location it was originally cut from.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    pub frame: Frame,
    pub crop_location: Option<Point>,
}

impl Template {
    pub fn new(frame: Frame) -> Self {
        Self {
            frame,
            crop_location: None,
        }
    }

    pub fn with_crop_location(mut self, x: i32, y: i32) -> Self {
        self.crop_location = Some(Point { x, y });
        self
    }
}

pub type TemplateLibrary = BTreeMap<String, Template>;

/// Everything a run needs besides the action graph.
///
/// The matcher lives here (not in a global) so each run or test harness owns its
/// location cache.
pub struct ExecutionContext<E> {
    pub executor: E,
    pub screen: Box<dyn ScreenSource>,
    pub matcher: TemplateMatcher,
    pub templates: TemplateLibrary,
    /// Opaque device handle, passed through to the executor untouched.
    pub device: Value,
}

impl<E> ExecutionContext<E> {
    pub fn new(executor: E) -> Self {
        Self {
            executor,
            screen: Box::new(NoScreen),
            matcher: TemplateMatcher::new(),
            templates: TemplateLibrary::new(),
            device: Value::Null,
        }
    }

    pub fn with_screen(mut self, screen: impl ScreenSource + 'static) -> Self {
        self.screen = Box::new(screen);
        self
    }

    pub fn with_matcher(mut self, matcher: TemplateMatcher) -> Self {
        self.matcher = matcher;
        self
    }

    pub fn with_templates(mut self, templates: TemplateLibrary) -> Self {
        self.templates = templates;
        self
    }

    pub fn with_template(mut self, name: impl Into<String>, template: Template) -> Self {
        self.templates.insert(name.into(), template);
        self
    }

    pub fn with_device(mut self, device: Value) -> Self {
        self.device = device;
        self
    }

    /// Borrow the executor and the rest of the context separately.
    pub fn split(&mut self) -> (&mut E, ActionScope<'_>) {
        (
            &mut self.executor,
            ActionScope {
                screen: self.screen.as_mut(),
                matcher: &mut self.matcher,
                templates: &self.templates,
                device: &self.device,
            },
        )
    }
}

/// The part of the context an executor may use while running one action.
pub struct ActionScope<'a> {
    pub screen: &'a mut dyn ScreenSource,
    pub matcher: &'a mut TemplateMatcher,
    pub templates: &'a TemplateLibrary,
    pub device: &'a Value,
}
