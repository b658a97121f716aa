//! Blank-viewport classification
//!
//! Samples random points in the viewport, asks the page which element is on
//! top at each point, and calls the viewport blank when enough points show
//! nothing meaningful. A point is blank when:
//!
//! - no element resolves there,
//! - the element is `html`/`body` with a transparent or white background and
//!   no background image,
//! - the element's box has zero width or height, or
//! - the element is hidden (display none, visibility hidden, or opacity 0).

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::config::BlankScreenConfig;
use crate::host::{ElementInfo, Page, Viewport};

/// Outcome of one classification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlankCheck {
    pub blank_points: u32,
    pub sample_count: u32,
    pub blank_ratio: f64,
    pub threshold: f64,
    pub is_blank: bool,
    pub viewport: Viewport,
}

/// Receives every positive classification from the scheduled path
pub type BlankCallback = Arc<dyn Fn(BlankCheck) + Send + Sync>;

/// Whether `blank_points` out of `sample_count` reaches the threshold.
pub fn is_blank_ratio(blank_points: u32, sample_count: u32, threshold: f64) -> bool {
    if sample_count == 0 {
        return false;
    }
    blank_points as f64 / sample_count as f64 >= threshold
}

/// Classify the element found at one sample point.
pub fn is_blank_point(element: Option<&ElementInfo>) -> bool {
    let Some(element) = element else {
        return true;
    };

    if element.is_page_root()
        && is_empty_background(&element.background_color)
        && element.background_image.is_none()
    {
        return true;
    }

    element.width <= 0.0 || element.height <= 0.0 || element.is_hidden()
}

/// Transparent or white background colour.
fn is_empty_background(color: &str) -> bool {
    let normalized: String = color
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_ascii_lowercase();

    match normalized.as_str() {
        "" | "transparent" | "white" | "#fff" | "#ffffff" | "#ffff" | "#ffffffff" => true,
        s if s.starts_with("rgba(") || s.starts_with("rgb(") => {
            let inner = s
                .trim_start_matches("rgba(")
                .trim_start_matches("rgb(")
                .trim_end_matches(')');
            let parts: Vec<f64> = inner
                .split(',')
                .filter_map(|p| p.trim_end_matches('%').parse().ok())
                .collect();
            match parts.as_slice() {
                [_, _, _, alpha] if *alpha == 0.0 => true,
                [r, g, b, ..] => *r >= 255.0 && *g >= 255.0 && *b >= 255.0,
                _ => false,
            }
        }
        _ => false,
    }
}

/// Random-point classifier over a page's viewport.
pub struct BlankScreenClassifier {
    config: BlankScreenConfig,
    rng: StdRng,
}

impl BlankScreenClassifier {
    pub fn new(config: BlankScreenConfig) -> Self {
        Self {
            config,
            rng: StdRng::from_entropy(),
        }
    }

    /// Deterministic sample points, for tests and replays.
    pub fn with_seed(config: BlankScreenConfig, seed: u64) -> Self {
        Self {
            config,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn config(&self) -> &BlankScreenConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: BlankScreenConfig) {
        self.config = config;
    }

    /// Independent uniform points inside the viewport.
    pub fn sample_points(&mut self, viewport: &Viewport) -> Vec<(f64, f64)> {
        (0..self.config.sample_count)
            .map(|_| {
                let x = if viewport.width > 0.0 {
                    self.rng.gen_range(0.0..viewport.width)
                } else {
                    0.0
                };
                let y = if viewport.height > 0.0 {
                    self.rng.gen_range(0.0..viewport.height)
                } else {
                    0.0
                };
                (x, y)
            })
            .collect()
    }

    /// Classify the page's current viewport immediately.
    pub fn classify(&mut self, page: &dyn Page) -> BlankCheck {
        let viewport = page.viewport();
        let sample_count = self.config.sample_count;

        let blank_points = if viewport.width <= 0.0 || viewport.height <= 0.0 {
            sample_count
        } else {
            self.sample_points(&viewport)
                .into_iter()
                .filter(|&(x, y)| is_blank_point(page.element_at(x, y).as_ref()))
                .count() as u32
        };

        let blank_ratio = if sample_count == 0 {
            0.0
        } else {
            blank_points as f64 / sample_count as f64
        };
        let is_blank = is_blank_ratio(blank_points, sample_count, self.config.threshold);

        tracing::debug!(
            blank_points,
            sample_count,
            blank_ratio,
            is_blank,
            "Blank-screen check"
        );

        BlankCheck {
            blank_points,
            sample_count,
            blank_ratio,
            threshold: self.config.threshold,
            is_blank,
            viewport,
        }
    }
}

/// Schedule classification after document readiness plus the settle delay,
/// repeating at `recheck_interval_ms` when set.
pub fn spawn_watch(
    classifier: Arc<Mutex<BlankScreenClassifier>>,
    page: Arc<dyn Page>,
    on_blank: BlankCallback,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        page.ready().await;

        let (delay, recheck) = {
            let classifier = classifier.lock();
            let config = classifier.config();
            (config.delay_ms, config.recheck_interval_ms)
        };
        tokio::time::sleep(Duration::from_millis(delay)).await;

        loop {
            let check = classifier.lock().classify(page.as_ref());
            if check.is_blank {
                tracing::info!(
                    blank_ratio = check.blank_ratio,
                    "Viewport classified as blank"
                );
                on_blank(check);
            }

            match recheck {
                Some(interval) if interval > 0 => {
                    tokio::time::sleep(Duration::from_millis(interval)).await;
                }
                _ => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::StaticPage;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Page whose left `blank_fraction` of the width shows nothing.
    struct SplitPage {
        blank_fraction: f64,
    }

    #[async_trait]
    impl Page for SplitPage {
        fn url(&self) -> String {
            "https://app.example.com/".to_string()
        }

        fn user_agent(&self) -> String {
            "test-agent".to_string()
        }

        fn viewport(&self) -> Viewport {
            Viewport {
                width: 1000.0,
                height: 800.0,
                ..Default::default()
            }
        }

        fn element_at(&self, x: f64, _y: f64) -> Option<ElementInfo> {
            if x < self.blank_fraction * 1000.0 {
                None
            } else {
                Some(ElementInfo::visible("main", 500.0, 800.0))
            }
        }
    }

    /// Page whose first `blank` resolved points show nothing.
    struct CountedPage {
        blank: usize,
        resolved: AtomicUsize,
    }

    impl CountedPage {
        fn new(blank: usize) -> Self {
            Self {
                blank,
                resolved: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Page for CountedPage {
        fn url(&self) -> String {
            "https://app.example.com/".to_string()
        }

        fn user_agent(&self) -> String {
            "test-agent".to_string()
        }

        fn viewport(&self) -> Viewport {
            Viewport {
                width: 1000.0,
                height: 800.0,
                ..Default::default()
            }
        }

        fn element_at(&self, _x: f64, _y: f64) -> Option<ElementInfo> {
            if self.resolved.fetch_add(1, Ordering::SeqCst) < self.blank {
                None
            } else {
                Some(ElementInfo::visible("main", 1000.0, 800.0))
            }
        }
    }

    fn config(sample_count: u32, threshold: f64) -> BlankScreenConfig {
        BlankScreenConfig {
            enabled: true,
            sample_count,
            threshold,
            delay_ms: 100,
            recheck_interval_ms: None,
        }
    }

    #[test]
    fn test_threshold_boundary() {
        assert!(is_blank_ratio(10, 10, 0.8));
        assert!(is_blank_ratio(9, 10, 0.8));
        assert!(is_blank_ratio(8, 10, 0.8));
        assert!(!is_blank_ratio(7, 10, 0.8));
        assert!(!is_blank_ratio(0, 0, 0.8));
    }

    #[test]
    fn test_classify_at_threshold_boundary() {
        for (blank, expected) in [(7, false), (8, true), (9, true), (10, true)] {
            let mut classifier = BlankScreenClassifier::with_seed(config(10, 0.8), 3);
            let check = classifier.classify(&CountedPage::new(blank));
            assert_eq!(check.blank_points, blank as u32);
            assert_eq!(check.is_blank, expected, "{} of 10 blank", blank);
        }
    }

    #[test]
    fn test_point_classification() {
        assert!(is_blank_point(None));

        let mut body = ElementInfo::visible("body", 1000.0, 800.0);
        body.background_color = "rgba(0, 0, 0, 0)".to_string();
        assert!(is_blank_point(Some(&body)));

        body.background_color = "rgb(255, 255, 255)".to_string();
        assert!(is_blank_point(Some(&body)));

        body.background_image = Some("url(hero.png)".to_string());
        assert!(!is_blank_point(Some(&body)));

        let mut html = ElementInfo::visible("html", 1000.0, 800.0);
        html.background_color = "rgb(20, 20, 20)".to_string();
        assert!(!is_blank_point(Some(&html)));

        let collapsed = ElementInfo::visible("div", 0.0, 40.0);
        assert!(is_blank_point(Some(&collapsed)));

        let mut hidden = ElementInfo::visible("div", 100.0, 40.0);
        hidden.visibility = "hidden".to_string();
        assert!(is_blank_point(Some(&hidden)));

        let content = ElementInfo::visible("div", 100.0, 40.0);
        assert!(!is_blank_point(Some(&content)));
    }

    #[test]
    fn test_background_colours() {
        assert!(is_empty_background("transparent"));
        assert!(is_empty_background("#FFF"));
        assert!(is_empty_background("rgba(12, 34, 56, 0)"));
        assert!(is_empty_background("rgba(255,255,255,0.5)"));
        assert!(!is_empty_background("rgb(250, 250, 250)"));
        assert!(!is_empty_background("#000"));
    }

    #[test]
    fn test_fully_blank_page_is_blank() {
        let mut classifier = BlankScreenClassifier::with_seed(config(10, 0.8), 7);
        let check = classifier.classify(&SplitPage {
            blank_fraction: 1.0,
        });
        assert_eq!(check.blank_points, 10);
        assert!(check.is_blank);
    }

    #[test]
    fn test_rendered_page_is_not_blank() {
        let mut classifier = BlankScreenClassifier::with_seed(config(10, 0.8), 7);
        let check = classifier.classify(&SplitPage {
            blank_fraction: 0.0,
        });
        assert_eq!(check.blank_points, 0);
        assert!(!check.is_blank);
    }

    #[test]
    fn test_zero_sized_viewport_counts_every_point_blank() {
        let mut classifier = BlankScreenClassifier::with_seed(config(5, 0.8), 1);
        let check = classifier.classify(&StaticPage::default());
        assert_eq!(check.blank_points, 5);
        assert!(check.is_blank);
    }

    #[test]
    fn test_sample_points_stay_inside_viewport() {
        let mut classifier = BlankScreenClassifier::with_seed(config(200, 0.8), 42);
        let viewport = Viewport {
            width: 320.0,
            height: 640.0,
            ..Default::default()
        };
        for (x, y) in classifier.sample_points(&viewport) {
            assert!((0.0..320.0).contains(&x));
            assert!((0.0..640.0).contains(&y));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_waits_for_settle_delay() {
        let classifier = Arc::new(Mutex::new(BlankScreenClassifier::with_seed(
            config(10, 0.8),
            3,
        )));
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_in_callback = hits.clone();

        let handle = spawn_watch(
            classifier,
            Arc::new(SplitPage {
                blank_fraction: 1.0,
            }),
            Arc::new(move |check: BlankCheck| {
                assert!(check.is_blank);
                hits_in_callback.fetch_add(1, Ordering::SeqCst);
            }),
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        handle.await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
