use reqwest::Client;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Флаг online/offline. Хост (или фоновая проверка) сообщает о смене состояния;
/// переход offline → online возвращает `true`, чтобы вызывающий запустил drain.
#[derive(Clone)]
pub struct Connectivity {
    online: Arc<AtomicBool>,
}

impl Connectivity {
    pub fn new(initially_online: bool) -> Self {
        Self {
            online: Arc::new(AtomicBool::new(initially_online)),
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    /// Returns true only on an offline → online transition.
    pub fn set_online(&self, online: bool) -> bool {
        let was = self.online.swap(online, Ordering::AcqRel);
        !was && online
    }
}

// Проверка online статуса через легковесный HTTP запрос
pub async fn check_online_status(probe_url: Option<&str>) -> bool {
    let client = match Client::builder().timeout(Duration::from_secs(2)).build() {
        Ok(client) => client,
        Err(_) => return false,
    };

    if let Some(url) = probe_url {
        if let Ok(response) = client.get(url).send().await {
            // Any HTTP answer means the network path works
            let _ = response.status();
            return true;
        }
    }

    match client
        .get("https://www.cloudflare.com/cdn-cgi/trace")
        .send()
        .await
    {
        Ok(response) => response.status().is_success(),
        Err(_) => match client.get("https://www.google.com/generate_204").send().await {
            Ok(response) => response.status().is_success() || response.status().as_u16() == 204,
            Err(_) => false,
        },
    }
}
