use crate::ccimpl::{AccessFlags, CcImpl, CcImplInfo, CcMsgRes, ImplCtx};
use crate::fields::EventTrigger;
use zwusb_cc::commands::SceneActivationCmd;
use zwusb_cc::InMsg;
use zwusb_core::prelude::*;

/// Scene activation: no host field, just a UserAction trigger whenever the
/// device fires a scene. A unit option picks whether repeats of the same
/// scene number re-fire.
pub struct SceneActivationImpl {
    info: CcImplInfo,
    fire_on_change_only: bool,
    last_scene: Option<u8>,
}

impl SceneActivationImpl {
    pub fn new(fire_on_change_only: bool) -> Self {
        Self {
            info: CcImplInfo::new(
                CommandClass::SceneActivation,
                "Scene",
                AccessFlags::default(),
            ),
            fire_on_change_only,
            last_scene: None,
        }
    }
}

impl CcImpl for SceneActivationImpl {
    fn info(&self) -> &CcImplInfo {
        &self.info
    }

    fn info_mut(&mut self) -> &mut CcImplInfo {
        &mut self.info
    }

    fn handle_cc_msg(&mut self, class: u8, cmd: u8, msg: &InMsg, ctx: &mut ImplCtx) -> CcMsgRes {
        if class != CommandClass::SceneActivation.id() || cmd != SceneActivationCmd::Set as u8 {
            return CcMsgRes::Unhandled;
        }
        let Some(scene) = msg.cc_byte_at(2) else {
            return CcMsgRes::HandledNoValue;
        };
        if scene == 0 {
            return CcMsgRes::HandledNoValue;
        }

        if self.fire_on_change_only && self.last_scene == Some(scene) {
            return CcMsgRes::HandledNoValue;
        }
        self.last_scene = Some(scene);
        self.info.note_valid_value(ctx.now);

        ctx.fields.emit_trigger(EventTrigger::UserAction {
            node: self.info.node(),
            action: scene as u32,
        });
        CcMsgRes::HandledValue
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fields::{FieldStore, MemoryFieldStore};
    use std::time::Instant;

    fn app_cmd(src: u8, cc: &[u8]) -> InMsg {
        let mut msg = vec![0u8, 0x00, 0x04, 0x00, src, cc.len() as u8];
        msg.extend_from_slice(cc);
        msg[0] = msg.len() as u8;
        InMsg::from_message(&msg, Instant::now()).unwrap()
    }

    #[test]
    fn test_fires_user_action() {
        let store = MemoryFieldStore::new();
        let mut imp = SceneActivationImpl::new(false);
        imp.info_mut()
            .bind(NodeId::new(3), 1, false, ListenerClass::AlwaysOn);

        let mut out = Vec::new();
        let mut ctx = ImplCtx {
            fields: &store,
            out: &mut out,
            now: Instant::now(),
            send_triggers: true,
        };
        let msg = app_cmd(3, &[0x2b, 0x01, 0x04, 0x00]);
        imp.handle_cc_msg(0x2b, 0x01, &msg, &mut ctx);
        imp.handle_cc_msg(0x2b, 0x01, &msg, &mut ctx);
        assert_eq!(store.triggers().len(), 2, "every receipt fires");
    }

    #[test]
    fn test_fire_on_change_only() {
        let store = MemoryFieldStore::new();
        let mut imp = SceneActivationImpl::new(true);
        imp.info_mut()
            .bind(NodeId::new(3), 1, false, ListenerClass::AlwaysOn);

        let mut out = Vec::new();
        let mut ctx = ImplCtx {
            fields: &store,
            out: &mut out,
            now: Instant::now(),
            send_triggers: true,
        };
        let scene4 = app_cmd(3, &[0x2b, 0x01, 0x04, 0x00]);
        let scene5 = app_cmd(3, &[0x2b, 0x01, 0x05, 0x00]);
        imp.handle_cc_msg(0x2b, 0x01, &scene4, &mut ctx);
        imp.handle_cc_msg(0x2b, 0x01, &scene4, &mut ctx);
        imp.handle_cc_msg(0x2b, 0x01, &scene5, &mut ctx);
        assert_eq!(
            store.triggers(),
            vec![
                EventTrigger::UserAction {
                    node: NodeId::new(3),
                    action: 4
                },
                EventTrigger::UserAction {
                    node: NodeId::new(3),
                    action: 5
                },
            ]
        );
    }

    #[test]
    fn test_scene_zero_ignored() {
        let store = MemoryFieldStore::new();
        let mut imp = SceneActivationImpl::new(false);
        imp.info_mut()
            .bind(NodeId::new(3), 1, false, ListenerClass::AlwaysOn);
        let mut out = Vec::new();
        let mut ctx = ImplCtx {
            fields: &store,
            out: &mut out,
            now: Instant::now(),
            send_triggers: true,
        };
        let msg = app_cmd(3, &[0x2b, 0x01, 0x00, 0x00]);
        assert_eq!(
            imp.handle_cc_msg(0x2b, 0x01, &msg, &mut ctx),
            CcMsgRes::HandledNoValue
        );
        assert!(store.triggers().is_empty());
    }
}
