use anyhow::Context as _;
use std::io::Write;
use std::process::{Command, ExitStatus, Stdio};

/// Delivers the "worker disabled" alert.
pub trait Notifier {
    /// Best-effort delivery; the returned status is only ever logged.
    fn worker_disabled(&self, name: &str, command: &str) -> anyhow::Result<ExitStatus>;
}

impl<T: Notifier + ?Sized> Notifier for &T {
    fn worker_disabled(&self, name: &str, command: &str) -> anyhow::Result<ExitStatus> {
        (**self).worker_disabled(name, command)
    }
}

/// Pipes an RFC 822 message into a sendmail-compatible MTA (`sendmail -t`).
#[derive(Debug, Clone)]
pub struct SendmailNotifier {
    argv: Vec<String>,
    recipient: String,
    hostname: String,
}

impl SendmailNotifier {
    pub fn new(argv: Vec<String>, recipient: impl Into<String>) -> Self {
        let hostname = nix::unistd::gethostname()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());
        Self {
            argv,
            recipient: recipient.into(),
            hostname,
        }
    }

    pub fn recipient(&self) -> &str {
        &self.recipient
    }

    pub fn render_message(&self, name: &str, command: &str) -> String {
        let host = &self.hostname;
        format!(
            "From: CamSrv <root>\n\
             To: {to}\n\
             Subject: Problem with camera \"{name}\" on host \"{host}\"\n\
             \n\
             This is an automatically generated notification from camsrvd running on \"{host}\".\n\
             \n\
             The following camera has been disabled because its command has failed too many times:\n\
             \n\
             {name}\n\
             {command}\n\
             \n\
             You may wish to investigate what is going on. Further information might be available in the syslog.\n",
            to = self.recipient,
        )
    }
}

impl Notifier for SendmailNotifier {
    fn worker_disabled(&self, name: &str, command: &str) -> anyhow::Result<ExitStatus> {
        let Some((program, args)) = self.argv.split_first() else {
            anyhow::bail!("notifier command is empty");
        };
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .spawn()
            .with_context(|| format!("spawn notifier {program}"))?;
        let message = self.render_message(name, command);
        // Take stdin so it is closed (EOF for the MTA) before we wait.
        let write_result = match child.stdin.take() {
            Some(mut stdin) => stdin.write_all(message.as_bytes()),
            None => Ok(()),
        };
        let status = child
            .wait()
            .with_context(|| format!("wait for notifier {program}"))?;
        write_result.with_context(|| format!("write message to notifier {program}"))?;
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_names_camera_command_and_recipient() {
        let n = SendmailNotifier::new(vec!["/usr/lib/sendmail".into(), "-t".into()], "ops@example.org");
        let msg = n.render_message("front", "/usr/bin/ffmpeg -i \"rtsp://x\"");
        assert!(msg.starts_with("From: CamSrv <root>\nTo: ops@example.org\nSubject: Problem with camera \"front\""));
        assert!(msg.contains("\n\nfront\n/usr/bin/ffmpeg -i \"rtsp://x\"\n\n"));
    }

    #[test]
    fn exit_status_of_transport_is_returned() {
        let ok = SendmailNotifier::new(vec!["/bin/sh".into(), "-c".into(), "cat >/dev/null".into()], "a@b");
        assert!(ok.worker_disabled("front", "/bin/true").unwrap().success());

        let failing = SendmailNotifier::new(
            vec!["/bin/sh".into(), "-c".into(), "cat >/dev/null; exit 3".into()],
            "a@b",
        );
        let status = failing.worker_disabled("front", "/bin/true").unwrap();
        assert_eq!(status.code(), Some(3));
    }

    #[test]
    fn missing_transport_is_an_error() {
        let n = SendmailNotifier::new(vec!["/nonexistent/sendmail".into()], "a@b");
        assert!(n.worker_disabled("front", "/bin/true").is_err());
        let empty = SendmailNotifier::new(vec![], "a@b");
        assert!(empty.worker_disabled("front", "/bin/true").is_err());
    }
}
