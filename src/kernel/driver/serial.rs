// src/kernel/driver/serial.rs
//! Serial ポートドライバ (UART 16550)
//!
//! デバッグ出力専用。`init()` が呼ばれるまではポートに一切触れません。

use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};

use spin::Mutex;
use x86_64::instructions::port::{Port, PortReadOnly};

const COM1: u16 = 0x3F8;

/// Serial ポート (COM1)
pub struct SerialPort {
    data: Port<u8>,
    int_enable: Port<u8>,
    fifo_ctrl: Port<u8>,
    line_ctrl: Port<u8>,
    modem_ctrl: Port<u8>,
    line_status: PortReadOnly<u8>,
}

impl SerialPort {
    /// COM1 を作成 (0x3F8)
    pub const fn com1() -> Self {
        Self {
            data: Port::new(COM1),
            int_enable: Port::new(COM1 + 1),
            fifo_ctrl: Port::new(COM1 + 2),
            line_ctrl: Port::new(COM1 + 3),
            modem_ctrl: Port::new(COM1 + 4),
            line_status: PortReadOnly::new(COM1 + 5),
        }
    }

    fn init(&mut self) {
        // SAFETY: UART 16550 の標準的な初期化シーケンス。
        unsafe {
            // 割り込み無効化
            self.int_enable.write(0x00);
            // 38400 baud, 8N1 設定
            self.line_ctrl.write(0x80);
            self.data.write(0x03);
            self.int_enable.write(0x00);
            self.line_ctrl.write(0x03);
            // FIFO 有効化
            self.fifo_ctrl.write(0xC7);
            // DTR/RTS 設定
            self.modem_ctrl.write(0x0B);
        }
    }

    /// 送信バッファが空か確認
    fn is_tx_empty(&mut self) -> bool {
        // SAFETY: LSR のビット5は THR が空かどうかを示す。
        unsafe { self.line_status.read() & 0x20 != 0 }
    }

    fn write_byte(&mut self, byte: u8) -> fmt::Result {
        // 送信バッファが空になるまで待機（タイムアウト付き）
        const TIMEOUT: usize = 100_000;
        for _ in 0..TIMEOUT {
            if self.is_tx_empty() {
                // SAFETY: THR が空であることを確認済み。
                unsafe { self.data.write(byte) };
                return Ok(());
            }
            core::hint::spin_loop();
        }
        Err(fmt::Error)
    }
}

impl fmt::Write for SerialPort {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            self.write_byte(byte)?;
        }
        Ok(())
    }
}

/// グローバル Serial ポート (const 初期化可能)
pub static SERIAL1: Mutex<SerialPort> = Mutex::new(SerialPort::com1());

static READY: AtomicBool = AtomicBool::new(false);

/// COM1 を初期化し、デバッグ出力を有効にする
pub fn init() {
    SERIAL1.lock().init();
    READY.store(true, Ordering::Release);
}

/// デバッグ出力が有効か
pub fn is_ready() -> bool {
    READY.load(Ordering::Acquire)
}

/// フォーマット済み出力をシリアルに書き込む
///
/// 初期化前、またはロックが保持中（割り込みからの再入）の場合は破棄します。
pub fn write_debug(args: fmt::Arguments<'_>) {
    use fmt::Write;

    if !is_ready() {
        return;
    }
    if let Some(mut serial) = SERIAL1.try_lock() {
        // NOTE: デバッグ出力の書き込みエラーは無視する
        let _ = serial.write_fmt(args);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_before_init_is_dropped() {
        assert!(!is_ready());
        write_debug(format_args!("never reaches the port"));
    }
}
