//! Power management through logind.
//!
//! Capability queries map logind's `Can*` answers to a yes/no: `"yes"` and
//! `"challenge"` allow the action. Any bus failure reads as "not allowed"
//! or "not performed"; nothing here returns an error.

use tracing::{info, warn};
use zbus::{proxy, Connection};

use ldm_protocol::PowerAction;

#[proxy(
    interface = "org.freedesktop.login1.Manager",
    default_service = "org.freedesktop.login1",
    default_path = "/org/freedesktop/login1"
)]
trait Login1Manager {
    #[zbus(name = "CanSuspend")]
    fn can_suspend(&self) -> zbus::Result<String>;

    #[zbus(name = "CanHibernate")]
    fn can_hibernate(&self) -> zbus::Result<String>;

    #[zbus(name = "CanReboot")]
    fn can_reboot(&self) -> zbus::Result<String>;

    #[zbus(name = "CanPowerOff")]
    fn can_power_off(&self) -> zbus::Result<String>;

    #[zbus(name = "Suspend")]
    fn suspend(&self, interactive: bool) -> zbus::Result<()>;

    #[zbus(name = "Hibernate")]
    fn hibernate(&self, interactive: bool) -> zbus::Result<()>;

    #[zbus(name = "Reboot")]
    fn reboot(&self, interactive: bool) -> zbus::Result<()>;

    #[zbus(name = "PowerOff")]
    fn power_off(&self, interactive: bool) -> zbus::Result<()>;
}

/// Whether a logind `Can*` answer permits the action.
pub fn answer_allows(answer: &str) -> bool {
    matches!(answer, "yes" | "challenge")
}

/// Asks logind whether `action` is currently possible.
pub async fn can_perform(action: PowerAction) -> bool {
    match query(action).await {
        Ok(answer) => answer_allows(&answer),
        Err(e) => {
            warn!(action = %action, error = %e, "Power capability query failed");
            false
        }
    }
}

/// Asks logind to carry out `action`. Returns whether the request was
/// accepted.
pub async fn perform(action: PowerAction) -> bool {
    match request(action).await {
        Ok(()) => {
            info!(action = %action, "Power action requested");
            true
        }
        Err(e) => {
            warn!(action = %action, error = %e, "Power action failed");
            false
        }
    }
}

async fn manager() -> zbus::Result<Login1ManagerProxy<'static>> {
    let connection = Connection::system().await?;
    Login1ManagerProxy::new(&connection).await
}

async fn query(action: PowerAction) -> zbus::Result<String> {
    let manager = manager().await?;
    match action {
        PowerAction::Suspend => manager.can_suspend().await,
        PowerAction::Hibernate => manager.can_hibernate().await,
        PowerAction::Restart => manager.can_reboot().await,
        PowerAction::Shutdown => manager.can_power_off().await,
    }
}

async fn request(action: PowerAction) -> zbus::Result<()> {
    let manager = manager().await?;
    match action {
        PowerAction::Suspend => manager.suspend(false).await,
        PowerAction::Hibernate => manager.hibernate(false).await,
        PowerAction::Restart => manager.reboot(false).await,
        PowerAction::Shutdown => manager.power_off(false).await,
    }
}
