use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use anyhow::{anyhow, bail, Context, Result};
use shared::domain::{MatrixUserId, RemoteUserId};
use storage::{BridgeStore, PuppetRecord};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{matrix::Intent, user::User, Bridge};

/// The federated identity standing in for one remote user. When the remote
/// user is also a bridge user it may carry a double puppet.
pub struct Puppet {
    pub id: RemoteUserId,
    /// Ghost account owned by the bridge.
    pub mxid: MatrixUserId,
    store: Arc<dyn BridgeStore>,
    pub(crate) record: Mutex<PuppetRecord>,
    custom_active: AtomicBool,
}

impl Puppet {
    pub(crate) fn new(record: PuppetRecord, mxid: MatrixUserId, store: Arc<dyn BridgeStore>) -> Self {
        Self {
            id: record.remote_id.clone(),
            mxid,
            store,
            record: Mutex::new(record),
            custom_active: AtomicBool::new(false),
        }
    }

    pub async fn custom_mxid(&self) -> Option<MatrixUserId> {
        self.record.lock().await.custom_mxid.clone()
    }

    pub fn ghost_intent(&self) -> Intent {
        Intent::Ghost(self.mxid.clone())
    }

    /// Double puppet credentials as stored, validated or not.
    async fn stored_custom_intent(&self) -> Option<(MatrixUserId, Intent)> {
        let record = self.record.lock().await;
        let mxid = record.custom_mxid.clone()?;
        let access_token = record.access_token.clone().filter(|t| !t.is_empty())?;
        Some((
            mxid.clone(),
            Intent::DoublePuppet { mxid, access_token },
        ))
    }

    /// The double puppet intent, only once its token has been validated.
    pub async fn custom_intent(&self) -> Option<Intent> {
        if !self.custom_active.load(Ordering::Acquire) {
            return None;
        }
        self.stored_custom_intent().await.map(|(_, intent)| intent)
    }

    pub async fn save(&self) -> Result<()> {
        let record = self.record.lock().await.clone();
        self.store.update_puppet(&record).await
    }

    pub async fn reload(&self) -> Result<()> {
        if let Some(record) = self.store.get_puppet(&self.id).await? {
            *self.record.lock().await = record;
        }
        Ok(())
    }
}

impl Bridge {
    /// Binds `mxid` as the double puppet of `puppet` after checking that
    /// `access_token` really belongs to it. An empty token clears instead.
    pub async fn switch_custom_mxid(
        &self,
        puppet: &Arc<Puppet>,
        access_token: &str,
        mxid: &MatrixUserId,
    ) -> Result<()> {
        if access_token.is_empty() {
            return self.clear_custom_mxid(puppet).await;
        }
        let intent = Intent::DoublePuppet {
            mxid: mxid.clone(),
            access_token: access_token.to_owned(),
        };
        let owner = self
            .matrix
            .whoami(&intent)
            .await
            .context("failed to validate double puppet token")?;
        if owner != *mxid {
            bail!("access token belongs to {owner}, not {mxid}");
        }

        if let Some(holder) = self.get_puppet_by_custom_mxid(mxid).await? {
            if !Arc::ptr_eq(&holder, puppet) {
                self.detach_custom_mxid(&holder).await?;
                warn!(puppet = %puppet.id, previous = %holder.id, %mxid, "double puppet moved over from another puppet");
            }
        }

        let mut updated = puppet.record.lock().await.clone();
        updated.access_token = Some(access_token.to_owned());
        let previous = updated.custom_mxid.replace(mxid.clone());
        self.store
            .update_puppet(&updated)
            .await
            .with_context(|| format!("failed to save double puppet {mxid}"))?;
        {
            let mut record = puppet.record.lock().await;
            record.access_token = updated.access_token;
            record.custom_mxid = updated.custom_mxid;
        }
        self.reindex_puppet_custom_mxid(puppet, previous.as_ref(), Some(mxid))
            .await;
        puppet.custom_active.store(true, Ordering::Release);
        info!(puppet = %puppet.id, %mxid, "double puppeting enabled");
        Ok(())
    }

    /// Forgets the double puppet, then invalidates its token on the
    /// homeserver. Local state is cleared even if that last step fails.
    pub async fn clear_custom_mxid(&self, puppet: &Arc<Puppet>) -> Result<()> {
        let (previous, access_token) = self.detach_custom_mxid(puppet).await?;

        if let (Some(mxid), Some(access_token)) = (previous, access_token) {
            info!(puppet = %puppet.id, %mxid, "double puppeting disabled");
            self.matrix
                .logout(&Intent::DoublePuppet { mxid, access_token })
                .await
                .context("failed to invalidate double puppet token")?;
        }
        Ok(())
    }

    /// Drops the stored double puppet of `puppet` and hands back what it
    /// held. The record is saved before memory and the index change.
    async fn detach_custom_mxid(
        &self,
        puppet: &Arc<Puppet>,
    ) -> Result<(Option<MatrixUserId>, Option<String>)> {
        let mut updated = puppet.record.lock().await.clone();
        let previous = updated.custom_mxid.take();
        let access_token = updated.access_token.take();
        self.store
            .update_puppet(&updated)
            .await
            .with_context(|| format!("failed to clear double puppet of {}", puppet.id))?;
        {
            let mut record = puppet.record.lock().await;
            record.custom_mxid = None;
            record.access_token = None;
        }
        puppet.custom_active.store(false, Ordering::Release);
        self.reindex_puppet_custom_mxid(puppet, previous.as_ref(), None)
            .await;
        Ok((previous, access_token))
    }

    /// Revalidates the stored double puppet token. With `relogin`, an
    /// invalid token is replaced through shared-secret login when possible.
    pub async fn start_custom_mxid(&self, puppet: &Arc<Puppet>, relogin: bool) -> Result<()> {
        let Some((mxid, intent)) = puppet.stored_custom_intent().await else {
            puppet.custom_active.store(false, Ordering::Release);
            return Ok(());
        };
        let failure = match self.matrix.whoami(&intent).await {
            Ok(owner) if owner == mxid => {
                puppet.custom_active.store(true, Ordering::Release);
                debug!(puppet = %puppet.id, %mxid, "double puppet token is valid");
                return Ok(());
            }
            Ok(owner) => anyhow!("token belongs to {owner}"),
            Err(err) => err,
        };
        puppet.custom_active.store(false, Ordering::Release);

        if relogin {
            if let Some(secret) = self.config.shared_secret_for(&mxid) {
                warn!(puppet = %puppet.id, %mxid, error = %failure, "double puppet token invalid, logging in again");
                let access_token = self
                    .matrix
                    .login_with_shared_secret(&mxid, secret)
                    .await
                    .context("shared secret login failed")?;
                return self.switch_custom_mxid(puppet, &access_token, &mxid).await;
            }
        }
        Err(failure.context(format!("stored double puppet token for {mxid} is not valid")))
    }

    /// Enables double puppeting for `user` through shared-secret login and
    /// resyncs their direct chat list.
    pub async fn login_double_puppet(&self, user: &Arc<User>) -> Result<()> {
        let secret = self
            .config
            .shared_secret_for(&user.mxid)
            .ok_or_else(|| anyhow!("no shared secret configured for {}", user.mxid))?;
        let remote_id = user
            .remote_id()
            .await
            .ok_or_else(|| anyhow!("{} has no linked remote account yet", user.mxid))?;
        let puppet = self.get_puppet_by_id(&remote_id).await?;
        let access_token = self
            .matrix
            .login_with_shared_secret(&user.mxid, secret)
            .await
            .context("shared secret login failed")?;
        self.switch_custom_mxid(&puppet, &access_token, &user.mxid)
            .await?;
        self.update_direct_chats(user, None).await;
        Ok(())
    }

    /// Disables the double puppet of `user`'s own remote account, if any.
    pub async fn logout_double_puppet(&self, user: &Arc<User>) -> Result<()> {
        let Some(remote_id) = user.remote_id().await else {
            return Ok(());
        };
        let puppet = self.get_puppet_by_id(&remote_id).await?;
        if puppet.custom_mxid().await.is_none() {
            return Ok(());
        }
        self.clear_custom_mxid(&puppet).await
    }

    /// Runs on connect: sets up double puppeting when a shared secret is
    /// configured for the user's homeserver and none is active yet.
    pub(crate) async fn try_automatic_double_puppeting(&self, user: &Arc<User>) {
        if self.config.shared_secret_for(&user.mxid).is_none() {
            return;
        }
        let Some(remote_id) = user.remote_id().await else {
            return;
        };
        match self.get_puppet_by_id(&remote_id).await {
            Ok(puppet) if puppet.custom_mxid().await.is_some() => {
                debug!(user = %user.mxid, "double puppet already configured");
                return;
            }
            Ok(_) => {}
            Err(err) => {
                warn!(user = %user.mxid, error = %err, "failed to load own puppet");
                return;
            }
        }
        match self.login_double_puppet(user).await {
            Ok(()) => info!(user = %user.mxid, "automatic double puppeting enabled"),
            Err(err) => {
                warn!(user = %user.mxid, error = %err, "automatic double puppeting failed")
            }
        }
    }

    /// Revalidates every stored double puppet. Failures are logged.
    pub(crate) async fn start_double_puppets(&self) -> Result<()> {
        for puppet in self.all_puppets_with_custom_mxid().await? {
            if let Err(err) = self.start_custom_mxid(&puppet, true).await {
                warn!(puppet = %puppet.id, error = %err, "failed to start double puppet");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/puppet_tests.rs"]
mod tests;
