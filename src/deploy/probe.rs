use std::time::Duration;

use async_trait::async_trait;

/// Post-deploy health check. Returns the HTTP status, or a description of
/// why no response was received.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, url: &str) -> std::result::Result<u16, String>;
}

pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    /// `accept_invalid_certs` is for staging certificates, which no trust
    /// store accepts.
    pub fn new(timeout: Duration, accept_invalid_certs: bool) -> crate::error::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(accept_invalid_certs)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| crate::error::RiggerError::Config(format!("HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn probe(&self, url: &str) -> std::result::Result<u16, String> {
        self.client
            .get(url)
            .send()
            .await
            .map(|resp| resp.status().as_u16())
            .map_err(|e| e.to_string())
    }
}

#[cfg(test)]
pub use scripted::ScriptedProbe;

#[cfg(test)]
mod scripted {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::HealthProbe;

    /// Answers from a script; the last answer repeats once the script runs out.
    pub struct ScriptedProbe {
        answers: Mutex<VecDeque<Result<u16, String>>>,
        urls: Mutex<Vec<String>>,
    }

    impl ScriptedProbe {
        pub fn new(answers: Vec<Result<u16, String>>) -> Self {
            Self {
                answers: Mutex::new(answers.into()),
                urls: Mutex::new(Vec::new()),
            }
        }

        pub fn always(status: u16) -> Self {
            Self::new(vec![Ok(status)])
        }

        pub fn urls(&self) -> Vec<String> {
            self.urls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl HealthProbe for ScriptedProbe {
        async fn probe(&self, url: &str) -> Result<u16, String> {
            self.urls.lock().unwrap().push(url.to_string());
            let mut answers = self.answers.lock().unwrap();
            if answers.len() > 1 {
                answers.pop_front().unwrap_or(Ok(200))
            } else {
                answers.front().cloned().unwrap_or(Ok(200))
            }
        }
    }
}
