//! The command handler (C4, §4.4): decodes one of six opcodes from a
//! request buffer, dispatches to C2/C3, and encodes the response.

use sentinel::log;
use uguid::Guid;
use varstore_core::{is_delete_request, is_pk, next_secure_boot_state, EfiStatus, SecureBootState, StoreError, VariableAttributes};
use varstore_wire::{Reader, WireError, Writer};

use crate::context::RootContext;

const PROTOCOL_VERSION: u32 = 1;

const OP_GET_VARIABLE: u32 = 1;
const OP_SET_VARIABLE: u32 = 2;
const OP_GET_NEXT_VARIABLE: u32 = 3;
const OP_QUERY_VARIABLE_INFO: u32 = 4;
const OP_NOTIFY_SB_FAILURE: u32 = 5;
const OP_GET_PLATFORM_CONFIG: u32 = 6;

/// Handles one request, always producing a well-formed response: a
/// malformed or truncated request yields `InvalidParameter` rather than
/// propagating the wire error to the caller. Returns the number of bytes
/// written to `response`.
pub fn handle(ctx: &mut RootContext, request: &[u8], response: &mut [u8]) -> usize {
    match dispatch(ctx, request, response) {
        Ok(len) => len,
        Err(_) => {
            let mut w = Writer::new(response);
            match w.write_uintn(EfiStatus::InvalidParameter.raw()) {
                Ok(()) => w.position(),
                Err(_) => 0,
            }
        }
    }
}

fn dispatch(ctx: &mut RootContext, request: &[u8], response: &mut [u8]) -> Result<usize, WireError> {
    let mut r = Reader::new(request);
    let version = r.read_u32()?;
    let opcode = r.read_u32()?;
    let mut w = Writer::new(response);

    if version != PROTOCOL_VERSION {
        w.write_uintn(EfiStatus::Unsupported.raw())?;
        return Ok(w.position());
    }

    match opcode {
        OP_GET_VARIABLE => get_variable(ctx, &mut r, &mut w)?,
        OP_SET_VARIABLE => set_variable(ctx, &mut r, &mut w)?,
        OP_GET_NEXT_VARIABLE => get_next_variable(ctx, &mut r, &mut w)?,
        OP_QUERY_VARIABLE_INFO => query_variable_info(ctx, &mut r, &mut w)?,
        OP_NOTIFY_SB_FAILURE => notify_sb_failure(ctx, &mut w)?,
        OP_GET_PLATFORM_CONFIG => get_platform_config(ctx, &mut w)?,
        _ => w.write_uintn(EfiStatus::Unsupported.raw())?,
    }
    Ok(w.position())
}

fn get_variable(ctx: &RootContext, r: &mut Reader, w: &mut Writer) -> Result<(), WireError> {
    let name = r.read_name()?;
    let vendor = r.read_guid()?;
    let max_data = r.read_uintn()? as usize;

    match ctx.store.lookup(&name, &vendor) {
        Some(var) if var.data.len() > max_data => {
            w.write_uintn(EfiStatus::BufferTooSmall.raw())?;
            w.write_uintn(var.data.len() as u64)?;
        }
        Some(var) => {
            w.write_uintn(EfiStatus::Success.raw())?;
            w.write_u32(var.attributes.bits())?;
            w.write_data(&var.data)?;
        }
        None => w.write_uintn(EfiStatus::NotFound.raw())?,
    }
    Ok(())
}

fn set_variable(ctx: &mut RootContext, r: &mut Reader, w: &mut Writer) -> Result<(), WireError> {
    let name = r.read_name()?;
    let vendor = r.read_guid()?;
    let attrs = VariableAttributes::from_bits_truncate(r.read_u32()?);
    let at_runtime = r.read_bool()?;
    let data = r.read_data()?;

    let status = process_set_variable(ctx, &name, vendor, attrs, at_runtime, data);
    w.write_uintn(status.raw())?;
    Ok(())
}

fn process_set_variable(ctx: &mut RootContext, name: &[u16], vendor: Guid, attrs: VariableAttributes, at_runtime: bool, data: Vec<u8>) -> EfiStatus {
    if at_runtime && !attrs.contains(VariableAttributes::RUNTIME_ACCESS) {
        return EfiStatus::InvalidParameter;
    }

    if attrs.is_authenticated() {
        return process_authenticated_write(ctx, name, vendor, attrs, data);
    }

    let delete = is_delete_request(attrs, data.len());
    if !delete {
        if let Some(existing) = ctx.store.lookup(name, &vendor) {
            if existing.attributes.without_append() != attrs.without_append() {
                return EfiStatus::InvalidParameter;
            }
        }
    }

    if delete {
        return match ctx.store.remove(name, &vendor) {
            Ok(()) | Err(StoreError::NotFound) => EfiStatus::Success,
            Err(err) => err.into(),
        };
    }

    let append = attrs.contains(VariableAttributes::APPEND_WRITE);
    let result =
        if append { ctx.store.append(name, vendor, attrs, varstore_core::EfiTime::ZERO, &data) } else { ctx.store.upsert(name, vendor, attrs, varstore_core::EfiTime::ZERO, data.clone()) };

    match result {
        Ok(()) => {
            ctx.backend.set_variable(name, &vendor, attrs, varstore_core::EfiTime::ZERO, &data);
            EfiStatus::Success
        }
        Err(err) => err.into(),
    }
}

fn process_authenticated_write(ctx: &mut RootContext, name: &[u16], vendor: Guid, attrs: VariableAttributes, raw_payload: Vec<u8>) -> EfiStatus {
    let stored_timestamp = ctx.store.lookup(name, &vendor).map_or(varstore_core::EfiTime::ZERO, |v| v.timestamp);

    let verified = match ctx.auth.verify(&ctx.store, ctx.sb_state, name, &vendor, attrs, stored_timestamp, &raw_payload) {
        Ok(verified) => verified,
        Err(err) => return err.into(),
    };

    let deleting = is_delete_request(attrs, verified.content.len());
    if deleting && is_pk(name, &vendor) && ctx.sb_state == SecureBootState::Deployed {
        return EfiStatus::WriteProtected;
    }

    if deleting {
        if let Err(err) = ctx.store.remove(name, &vendor) {
            if err != StoreError::NotFound {
                return err.into();
            }
        }
    } else {
        let append = attrs.contains(VariableAttributes::APPEND_WRITE);
        let result = if append {
            ctx.store.append(name, vendor, attrs, verified.timestamp, &verified.content)
        } else {
            ctx.store.upsert_preserving_cert(name, vendor, attrs, verified.timestamp, verified.content.clone(), verified.cert.clone())
        };
        if let Err(err) = result {
            return err.into();
        }
    }

    ctx.sb_state = next_secure_boot_state(ctx.sb_state, name, &vendor, &verified.content, deleting);
    ctx.backend.set_variable(name, &vendor, attrs, verified.timestamp, &verified.content);
    EfiStatus::Success
}

fn get_next_variable(ctx: &RootContext, r: &mut Reader, w: &mut Writer) -> Result<(), WireError> {
    let max_name = r.read_uintn()? as usize;
    let name = r.read_name()?;
    let vendor = r.read_guid()?;

    match ctx.store.iter_after(&name, &vendor) {
        Ok(Some(key)) => {
            let required = (key.name.len() + 1) * 2;
            if required > max_name {
                w.write_uintn(EfiStatus::BufferTooSmall.raw())?;
                w.write_uintn(required as u64)?;
            } else {
                w.write_uintn(EfiStatus::Success.raw())?;
                w.write_name(&key.name)?;
                w.write_guid(&key.vendor)?;
            }
        }
        Ok(None) => w.write_uintn(EfiStatus::NotFound.raw())?,
        Err(err) => w.write_uintn(EfiStatus::from(err).raw())?,
    }
    Ok(())
}

fn query_variable_info(ctx: &RootContext, r: &mut Reader, w: &mut Writer) -> Result<(), WireError> {
    let attrs = VariableAttributes::from_bits_truncate(r.read_u32()?);
    let (max_storage, remaining, max_size) = ctx.store.remaining_storage(attrs);
    w.write_uintn(EfiStatus::Success.raw())?;
    w.write_u64(max_storage)?;
    w.write_u64(remaining)?;
    w.write_u64(max_size)?;
    Ok(())
}

/// Diagnostic-only: never mutates the store or secure-boot state (§4.4).
fn notify_sb_failure(ctx: &mut RootContext, w: &mut Writer) -> Result<(), WireError> {
    ctx.sb_failure_count += 1;
    log!(Warning, "guest reported a secure-boot verification failure (count={})", ctx.sb_failure_count);
    w.write_uintn(EfiStatus::Success.raw())?;
    Ok(())
}

/// Supplemented opcode (§10.5): bit 0 = secure boot enabled, bit 1 =
/// authentication enforced.
fn get_platform_config(ctx: &RootContext, w: &mut Writer) -> Result<(), WireError> {
    let mut flags: u32 = 0;
    if ctx.policy.secureboot {
        flags |= 1;
    }
    if ctx.policy.auth_enforce {
        flags |= 2;
    }
    w.write_uintn(EfiStatus::Success.raw())?;
    w.write_u32(flags)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use varstore_core::backend::MemoryBackend;
    use varstore_core::VariableStore;
    use xenstore::Policy;

    fn ctx() -> RootContext {
        RootContext::new(VariableStore::new(), Policy { secureboot: false, auth_enforce: true }, Box::new(MemoryBackend::new()))
    }

    fn name_bytes(s: &str) -> Vec<u16> {
        s.encode_utf16().collect()
    }

    fn encode_get_variable(name: &str, vendor: Guid, max_data: u64) -> Vec<u8> {
        let mut buf = vec![0u8; 256];
        let mut w = Writer::new(&mut buf);
        w.write_u32(PROTOCOL_VERSION).unwrap();
        w.write_u32(OP_GET_VARIABLE).unwrap();
        w.write_name(&name_bytes(name)).unwrap();
        w.write_guid(&vendor).unwrap();
        w.write_uintn(max_data).unwrap();
        buf.truncate(w.position());
        buf
    }

    fn encode_set_variable(name: &str, vendor: Guid, attrs: VariableAttributes, at_runtime: bool, data: &[u8]) -> Vec<u8> {
        let mut buf = vec![0u8; 256];
        let mut w = Writer::new(&mut buf);
        w.write_u32(PROTOCOL_VERSION).unwrap();
        w.write_u32(OP_SET_VARIABLE).unwrap();
        w.write_name(&name_bytes(name)).unwrap();
        w.write_guid(&vendor).unwrap();
        w.write_u32(attrs.bits()).unwrap();
        w.write_bool(at_runtime).unwrap();
        w.write_data(data).unwrap();
        buf.truncate(w.position());
        buf
    }

    #[test]
    fn get_nonexistent_variable_is_not_found() {
        let mut context = ctx();
        let request = encode_get_variable("BootOrder", Guid::from_bytes([1; 16]), 1024);
        let mut response = [0u8; 256];
        let len = handle(&mut context, &request, &mut response);
        let mut r = Reader::new(&response[..len]);
        assert_eq!(r.read_uintn().unwrap(), EfiStatus::NotFound.raw());
    }

    #[test]
    fn set_then_get_round_trips() {
        let mut context = ctx();
        let vendor = Guid::from_bytes([9; 16]);
        let attrs = VariableAttributes::BOOTSERVICE_ACCESS | VariableAttributes::RUNTIME_ACCESS;

        let set_req = encode_set_variable("Test", vendor, attrs, false, &[1, 2, 3]);
        let mut set_resp = [0u8; 256];
        let len = handle(&mut context, &set_req, &mut set_resp);
        assert_eq!(Reader::new(&set_resp[..len]).read_uintn().unwrap(), EfiStatus::Success.raw());

        let get_req = encode_get_variable("Test", vendor, 1024);
        let mut get_resp = [0u8; 256];
        let len = handle(&mut context, &get_req, &mut get_resp);
        let mut r = Reader::new(&get_resp[..len]);
        assert_eq!(r.read_uintn().unwrap(), EfiStatus::Success.raw());
        assert_eq!(r.read_u32().unwrap(), attrs.bits());
        assert_eq!(r.read_data().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn attribute_mismatch_is_rejected_and_leaves_store_unchanged() {
        let mut context = ctx();
        let vendor = Guid::from_bytes([9; 16]);
        let attrs = VariableAttributes::BOOTSERVICE_ACCESS | VariableAttributes::RUNTIME_ACCESS;
        handle(&mut context, &encode_set_variable("Test", vendor, attrs, false, &[1, 2, 3]), &mut [0u8; 256]);

        let mismatch_req = encode_set_variable("Test", vendor, VariableAttributes::BOOTSERVICE_ACCESS, false, &[9]);
        let mut resp = [0u8; 256];
        let len = handle(&mut context, &mismatch_req, &mut resp);
        assert_eq!(Reader::new(&resp[..len]).read_uintn().unwrap(), EfiStatus::InvalidParameter.raw());
        assert_eq!(context.store.lookup(&name_bytes("Test"), &vendor).unwrap().data, vec![1, 2, 3]);
    }

    #[test]
    fn clearing_access_bits_deletes_the_variable() {
        let mut context = ctx();
        let vendor = Guid::from_bytes([9; 16]);
        let attrs = VariableAttributes::BOOTSERVICE_ACCESS | VariableAttributes::RUNTIME_ACCESS;
        handle(&mut context, &encode_set_variable("Test", vendor, attrs, false, &[1]), &mut [0u8; 256]);

        let delete_req = encode_set_variable("Test", vendor, VariableAttributes::empty(), false, &[]);
        let mut resp = [0u8; 256];
        handle(&mut context, &delete_req, &mut resp);

        let get_req = encode_get_variable("Test", vendor, 1024);
        let mut get_resp = [0u8; 256];
        let len = handle(&mut context, &get_req, &mut get_resp);
        assert_eq!(Reader::new(&get_resp[..len]).read_uintn().unwrap(), EfiStatus::NotFound.raw());
    }

    #[test]
    fn buffer_too_small_reports_required_size() {
        let mut context = ctx();
        let vendor = Guid::from_bytes([9; 16]);
        let attrs = VariableAttributes::BOOTSERVICE_ACCESS | VariableAttributes::RUNTIME_ACCESS;
        let data = vec![0u8; 500];
        handle(&mut context, &encode_set_variable("Test", vendor, attrs, false, &data), &mut [0u8; 1024]);

        let get_req = encode_get_variable("Test", vendor, 100);
        let mut resp = [0u8; 256];
        let len = handle(&mut context, &get_req, &mut resp);
        let mut r = Reader::new(&resp[..len]);
        assert_eq!(r.read_uintn().unwrap(), EfiStatus::BufferTooSmall.raw());
        assert_eq!(r.read_uintn().unwrap(), 500);
    }

    #[test]
    fn get_platform_config_reports_policy_flags() {
        let mut context = ctx();
        context.policy.secureboot = true;
        let mut buf = vec![0u8; 16];
        let mut w = Writer::new(&mut buf);
        w.write_u32(PROTOCOL_VERSION).unwrap();
        w.write_u32(OP_GET_PLATFORM_CONFIG).unwrap();
        let written = w.position();

        let mut resp = [0u8; 32];
        let len = handle(&mut context, &buf[..written], &mut resp);
        let mut r = Reader::new(&resp[..len]);
        assert_eq!(r.read_uintn().unwrap(), EfiStatus::Success.raw());
        assert_eq!(r.read_u32().unwrap(), 0b11);
    }

    #[test]
    fn unknown_opcode_is_unsupported() {
        let mut context = ctx();
        let mut buf = vec![0u8; 16];
        let mut w = Writer::new(&mut buf);
        w.write_u32(PROTOCOL_VERSION).unwrap();
        w.write_u32(99).unwrap();
        let written = w.position();

        let mut resp = [0u8; 32];
        let len = handle(&mut context, &buf[..written], &mut resp);
        assert_eq!(Reader::new(&resp[..len]).read_uintn().unwrap(), EfiStatus::Unsupported.raw());
    }
}
