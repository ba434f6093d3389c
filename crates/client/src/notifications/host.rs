//! The window-side capabilities notification delivery relies on.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::audio::AlertTone;
use crate::error::HostError;

/// State of the host's native notification permission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativePermission {
    Granted,
    Denied,
    /// Not decided yet; native notifications are skipped until granted.
    Prompt,
    Unsupported,
}

/// A native (OS/browser) notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeNotification {
    pub title: String,
    pub body: String,
    pub icon: Option<String>,
    /// Deep link opened when the notification is clicked.
    pub link: String,
    pub conversation_id: String,
    /// Source message id; hosts may use it to collapse repeats.
    pub tag: String,
}

pub trait NotificationHost: Send + Sync {
    fn set_title(&self, title: &str);

    fn play_tone(&self, tone: &AlertTone) -> Result<(), HostError>;

    fn native_permission(&self) -> NativePermission;

    fn show_native(&self, notification: &NativeNotification) -> Result<(), HostError>;

    fn focus_window(&self) -> Result<(), HostError>;
}

/// Host without a window: everything goes to the log and is recorded.
pub struct HeadlessHost {
    permission: NativePermission,
    title: Mutex<String>,
    shown: Mutex<Vec<NativeNotification>>,
    tones: AtomicUsize,
    focus_requests: AtomicUsize,
}

impl HeadlessHost {
    pub fn new(permission: NativePermission) -> Self {
        Self {
            permission,
            title: Mutex::new(String::new()),
            shown: Mutex::new(Vec::new()),
            tones: AtomicUsize::new(0),
            focus_requests: AtomicUsize::new(0),
        }
    }

    pub fn title(&self) -> String {
        self.title.lock().clone()
    }

    pub fn shown(&self) -> Vec<NativeNotification> {
        self.shown.lock().clone()
    }

    pub fn tones_played(&self) -> usize {
        self.tones.load(Ordering::SeqCst)
    }

    pub fn focus_requests(&self) -> usize {
        self.focus_requests.load(Ordering::SeqCst)
    }
}

impl Default for HeadlessHost {
    fn default() -> Self {
        Self::new(NativePermission::Granted)
    }
}

impl NotificationHost for HeadlessHost {
    fn set_title(&self, title: &str) {
        let mut current = self.title.lock();
        if *current != title {
            tracing::debug!(title, "window title");
            *current = title.to_string();
        }
    }

    fn play_tone(&self, tone: &AlertTone) -> Result<(), HostError> {
        tracing::debug!(duration_ms = tone.duration().as_millis() as u64, "alert tone");
        self.tones.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn native_permission(&self) -> NativePermission {
        self.permission
    }

    fn show_native(&self, notification: &NativeNotification) -> Result<(), HostError> {
        match self.permission {
            NativePermission::Granted => {
                tracing::info!(
                    title = %notification.title,
                    link = %notification.link,
                    "{}",
                    notification.body
                );
                self.shown.lock().push(notification.clone());
                Ok(())
            }
            NativePermission::Unsupported => Err(HostError::Unsupported),
            NativePermission::Denied | NativePermission::Prompt => Err(HostError::PermissionDenied),
        }
    }

    fn focus_window(&self) -> Result<(), HostError> {
        self.focus_requests.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
