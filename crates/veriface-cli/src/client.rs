use anyhow::{Context, Result};

#[zbus::proxy(
    interface = "org.veriface.Verify1",
    default_service = "org.veriface.Verify1",
    default_path = "/org/veriface/Verify1"
)]
pub trait Verify {
    fn enroll(&self, subject: &str, label: &str, image: &[u8]) -> zbus::Result<String>;
    fn list_references(&self, subject: &str) -> zbus::Result<String>;
    fn remove_reference(&self, subject: &str, reference_id: &str) -> zbus::Result<bool>;
    fn open_session(&self, subject: &str) -> zbus::Result<String>;
    fn register_image(&self, session_id: &str, image: &[u8]) -> zbus::Result<()>;
    fn process_frame(&self, session_id: &str, frame: &[u8]) -> zbus::Result<String>;
    fn verify_photo(&self, session_id: &str, image: &[u8]) -> zbus::Result<String>;
    fn reset(&self, session_id: &str) -> zbus::Result<()>;
    fn full_reset(&self, session_id: &str) -> zbus::Result<()>;
    fn close_session(&self, session_id: &str) -> zbus::Result<bool>;
    fn session_status(&self, session_id: &str) -> zbus::Result<String>;
    fn status(&self) -> zbus::Result<String>;
}

/// Connect to the daemon on the system bus, or the session bus when asked.
pub async fn connect(session_bus: bool) -> Result<VerifyProxy<'static>> {
    let conn = if session_bus {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    }
    .context("failed to connect to D-Bus")?;

    VerifyProxy::new(&conn)
        .await
        .context("failed to reach verifaced; is the daemon running?")
}
